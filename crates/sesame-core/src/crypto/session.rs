//! AES-CCM 会话

use aes::Aes128;
use ccm::Ccm;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit, Payload};
use ccm::consts::{U4, U13};

use super::iv::{IV_SIZE, Iv, IvPolicy, Role};
use super::{CryptoError, Result};
use crate::protocol::{CMAC_TAG_SIZE, OsVersion, SECRET_SIZE, TOKEN_SIZE};

type SesameCcm = Ccm<Aes128, U4, U13>;

/// 关联数据固定为一个零字节
const AUTH_ADD_DATA: [u8; 1] = [0];

/// 一条连接上的加密状态
///
/// 加密方向由角色决定: central 加密用 c2p IV、解密用 p2c IV，peripheral 相反。
pub struct CryptSession {
    role: Role,
    policy: IvPolicy,
    cipher: Option<SesameCcm>,
    key: [u8; SECRET_SIZE],
    c2p_iv: Iv,
    p2c_iv: Iv,
}

impl CryptSession {
    pub fn new(version: OsVersion, role: Role) -> Self {
        let policy = match version {
            OsVersion::Os2 => IvPolicy::os2(),
            _ => IvPolicy::os3(),
        };
        Self {
            role,
            policy,
            cipher: None,
            key: [0u8; SECRET_SIZE],
            c2p_iv: [0u8; IV_SIZE],
            p2c_iv: [0u8; IV_SIZE],
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 设置会话密钥并初始化两个方向的 IV
    pub fn set_session_key(
        &mut self,
        key: &[u8; SECRET_SIZE],
        local_nonce: &[u8; TOKEN_SIZE],
        remote_nonce: &[u8; TOKEN_SIZE],
    ) -> Result<()> {
        let cipher = SesameCcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength)?;
        let (central, peripheral) = match self.role {
            Role::Central => (local_nonce, remote_nonce),
            Role::Peripheral => (remote_nonce, local_nonce),
        };
        self.policy
            .init_ivs(central, peripheral, &mut self.c2p_iv, &mut self.p2c_iv);
        self.cipher = Some(cipher);
        self.key = *key;
        log::debug!(
            "Session key set ({:?}), nonces central={} peripheral={}",
            self.role,
            hex::encode(central),
            hex::encode(peripheral)
        );
        Ok(())
    }

    pub fn is_key_shared(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn reset(&mut self) {
        self.cipher = None;
        self.key = [0u8; SECRET_SIZE];
    }

    /// 加密并附加 4 字节标签，加密方向 IV 随之前进
    pub fn encrypt(&mut self, plain: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyNotPrepared)?;
        let iv = match self.role {
            Role::Central => &self.c2p_iv,
            Role::Peripheral => &self.p2c_iv,
        };
        let out = cipher.encrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: plain,
                aad: &AUTH_ADD_DATA,
            },
        );
        self.advance_enc_iv();
        out.map_err(|_| CryptoError::Encrypt)
    }

    /// 校验并解密 (密文 + 4 字节标签)
    ///
    /// 只要密钥已就绪，无论成功与否解密方向 IV 都前进一次。
    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyNotPrepared)?;
        if data.len() < CMAC_TAG_SIZE {
            self.advance_dec_iv();
            return Err(CryptoError::TooShort(data.len()));
        }
        let iv = match self.role {
            Role::Central => &self.p2c_iv,
            Role::Peripheral => &self.c2p_iv,
        };
        let out = cipher.decrypt(
            GenericArray::from_slice(iv),
            Payload {
                msg: data,
                aad: &AUTH_ADD_DATA,
            },
        );
        self.advance_dec_iv();
        out.map_err(|_| CryptoError::Decrypt)
    }

    pub fn advance_enc_iv(&mut self) {
        match self.role {
            Role::Central => self.policy.advance_c2p(&mut self.c2p_iv),
            Role::Peripheral => self.policy.advance_p2c(&mut self.p2c_iv),
        }
    }

    pub fn advance_dec_iv(&mut self) {
        match self.role {
            Role::Central => self.policy.advance_p2c(&mut self.p2c_iv),
            Role::Peripheral => self.policy.advance_c2p(&mut self.c2p_iv),
        }
    }

    /// 登录认证码为会话密钥前 4 字节
    pub fn verify_auth_code(&self, code: &[u8]) -> bool {
        self.is_key_shared() && code == &self.key[..CMAC_TAG_SIZE]
    }

    pub fn enc_iv(&self) -> &Iv {
        match self.role {
            Role::Central => &self.c2p_iv,
            Role::Peripheral => &self.p2c_iv,
        }
    }

    pub fn dec_iv(&self) -> &Iv {
        match self.role {
            Role::Central => &self.p2c_iv,
            Role::Peripheral => &self.c2p_iv,
        }
    }

    /// (c2p, p2c) 计数器
    pub fn counters(&self) -> (u64, u64) {
        self.policy.counters()
    }
}
