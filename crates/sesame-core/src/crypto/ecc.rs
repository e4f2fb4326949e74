//! P-256 密钥对与 ECDH
//!
//! 公钥在线上为去掉 `0x04` 前缀的 64 字节 (X || Y)。

use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};

use super::{CryptoContext, CryptoError, Result};
use crate::protocol::{PK_SIZE, SECRET_SIZE, SK_SIZE};

const SEC1_UNCOMPRESSED_TAG: u8 = 0x04;

/// 64 字节裸公钥解析
pub fn public_key_from_binary(bin: &[u8; PK_SIZE]) -> Result<PublicKey> {
    let mut sec1 = [0u8; PK_SIZE + 1];
    sec1[0] = SEC1_UNCOMPRESSED_TAG;
    sec1[1..].copy_from_slice(bin);
    PublicKey::from_sec1_bytes(&sec1).map_err(|_| CryptoError::InvalidPublicKey)
}

pub fn public_key_to_binary(pk: &PublicKey) -> [u8; PK_SIZE] {
    let point = pk.to_encoded_point(false);
    let mut out = [0u8; PK_SIZE];
    out.copy_from_slice(&point.as_bytes()[1..]);
    out
}

/// 原始 ECDH 共享密钥 (x 坐标)
pub fn ecdh(sk: &SecretKey, peer: &[u8; PK_SIZE]) -> Result<[u8; 32]> {
    let pk = public_key_from_binary(peer)?;
    let shared = p256::ecdh::diffie_hellman(sk.to_nonzero_scalar(), pk.as_affine());
    let mut out = [0u8; 32];
    out.copy_from_slice(shared.raw_secret_bytes());
    Ok(out)
}

/// 设备 (服务端) 长期密钥对
#[derive(Default)]
pub struct Ecc {
    secret: Option<SecretKey>,
}

impl Ecc {
    pub fn has_keypair(&self) -> bool {
        self.secret.is_some()
    }

    pub fn generate_keypair(&mut self, ctx: &mut CryptoContext) {
        self.secret = Some(SecretKey::random(ctx.rng()));
    }

    pub fn load_key(&mut self, sk: &[u8; SK_SIZE]) -> Result<()> {
        let secret = SecretKey::from_slice(sk).map_err(|_| CryptoError::InvalidPrivateKey)?;
        self.secret = Some(secret);
        Ok(())
    }

    pub fn export_pk(&self) -> Result<[u8; PK_SIZE]> {
        let sk = self.secret.as_ref().ok_or(CryptoError::NoKeypair)?;
        Ok(public_key_to_binary(&sk.public_key()))
    }

    pub fn export_sk(&self) -> Result<[u8; SK_SIZE]> {
        let sk = self.secret.as_ref().ok_or(CryptoError::NoKeypair)?;
        Ok(sk.to_bytes().into())
    }

    pub fn ecdh(&self, peer: &[u8; PK_SIZE]) -> Result<[u8; 32]> {
        let sk = self.secret.as_ref().ok_or(CryptoError::NoKeypair)?;
        ecdh(sk, peer)
    }

    /// 注册时的共享 secret: ECDH 结果前 16 字节
    pub fn derive_secret(&self, peer: &[u8; PK_SIZE]) -> Result<[u8; SECRET_SIZE]> {
        let shared = self.ecdh(peer)?;
        let mut secret = [0u8; SECRET_SIZE];
        secret.copy_from_slice(&shared[..SECRET_SIZE]);
        Ok(secret)
    }
}
