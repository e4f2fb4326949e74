//! SESAME Crypto Module
//!
//! - AES-128-CMAC: 会话密钥派生与登录认证码
//! - AES-128-CCM (4 字节截断标签, 13 字节 IV): 消息加密
//! - ECDH (P-256): OS2 登录与 OS3 注册的密钥协商
//!
//! 随机数统一由 [`CryptoContext`] 提供，测试中可用固定种子替换。

pub mod ecc;
pub mod iv;
pub mod session;

use aes::Aes128;
use cmac::{Cmac, Mac};
use rand::rngs::{OsRng, StdRng};
use rand::{RngCore, SeedableRng};

use crate::protocol::TOKEN_SIZE;

pub use ecc::Ecc;
pub use iv::{IvPolicy, Role};
pub use session::CryptSession;

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("Failed to initialize RNG: {0}")]
    RngInit(String),
    #[error("Invalid key length")]
    InvalidKeyLength,
    #[error("Session key not prepared")]
    KeyNotPrepared,
    #[error("AEAD encryption failed")]
    Encrypt,
    #[error("AEAD authentication failed")]
    Decrypt,
    #[error("Encrypted message too short: {0} bytes")]
    TooShort(usize),
    #[error("Invalid private key")]
    InvalidPrivateKey,
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Keypair not generated")]
    NoKeypair,
}

pub type Result<T> = std::result::Result<T, CryptoError>;

/// AES-128-CMAC，`parts` 依次拼接作为消息
pub fn aes_cmac(key: &[u8; 16], parts: &[&[u8]]) -> Result<[u8; 16]> {
    let mut mac =
        <Cmac<Aes128> as Mac>::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
    for part in parts {
        mac.update(part);
    }
    Ok(mac.finalize().into_bytes().into())
}

/// 随机数来源
pub struct CryptoContext {
    rng: StdRng,
}

impl CryptoContext {
    /// 以操作系统熵初始化
    pub fn new() -> Result<Self> {
        let rng = StdRng::from_rng(OsRng).map_err(|e| CryptoError::RngInit(e.to_string()))?;
        Ok(Self { rng })
    }

    /// 固定种子，结果可复现
    pub fn from_seed(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn fill(&mut self, buf: &mut [u8]) {
        self.rng.fill_bytes(buf);
    }

    /// 4 字节随机 nonce / token
    pub fn token(&mut self) -> [u8; TOKEN_SIZE] {
        let mut tok = [0u8; TOKEN_SIZE];
        self.fill(&mut tok);
        tok
    }

    pub(crate) fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_cmac_rfc4493_vectors() {
        let key = hex!("2b7e151628aed2a6abf7158809cf4f3c");
        assert_eq!(
            aes_cmac(&key, &[]).unwrap(),
            hex!("bb1d6929e95937287fa37d129b756746")
        );
        let msg = hex!("6bc1bee22e409f96e93d7e117393172a");
        assert_eq!(
            aes_cmac(&key, &[&msg]).unwrap(),
            hex!("070a16b46b4d4144f79bdd9dd04a287c")
        );
        // 分段输入与整体输入一致
        assert_eq!(
            aes_cmac(&key, &[&msg[..5], &msg[5..]]).unwrap(),
            aes_cmac(&key, &[&msg]).unwrap()
        );
    }

    #[test]
    fn test_seeded_context_is_deterministic() {
        let mut a = CryptoContext::from_seed(42);
        let mut b = CryptoContext::from_seed(42);
        assert_eq!(a.token(), b.token());
        let mut c = CryptoContext::new().unwrap();
        let mut buf = [0u8; 32];
        c.fill(&mut buf);
    }
}
