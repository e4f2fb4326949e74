//! 按协议代际区分的消息处理
//!
//! 处理器持有本连接的 [`Transport`] 与 [`CryptSession`]，
//! 解码后的结果以 [`HandlerEvent`] 列表返回，由客户端按顺序应用。

pub mod os2;
pub mod os3;

use crate::crypto::{CryptSession, CryptoContext, CryptoError};
use crate::protocol::{
    HISTORY_TAG_UUID_SIZE, History, ItemCode, Model, OpCode, OsVersion, PK_SIZE, SECRET_SIZE,
    Setting, Status, TRIGGER_TAG_SIZE, TriggerType,
};
use crate::transport::{DecodeResult, Transport, TransportError};
use crate::util::{KeyParseError, hex_to_array, truncate_utf8};

pub use os2::Os2Handler;
pub use os3::Os3Handler;

/// 客户端连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    #[default]
    Idle,
    Authenticating,
    Active,
}

/// 处理器产出的事件
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerEvent {
    /// 连接必须断开
    Disconnect,
    StateChanged(ClientState),
    Setting(Setting),
    Status(Status),
    History(History),
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(#[from] KeyParseError),
    #[error("Public key is required for OS2 devices")]
    PublicKeyRequired,
    #[error("Keys are not set")]
    KeyNotSet,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type WriteFn<'a> = dyn FnMut(&[u8]) -> bool + 'a;

pub enum Handler {
    Os2(Os2Handler),
    Os3(Os3Handler),
}

impl Handler {
    /// 按型号选择处理器，客户端无法控制的型号 (Hub 3、BLE Connector 等) 返回 `None`
    pub fn for_model(model: Model) -> Option<Self> {
        match model {
            Model::Sesame3 | Model::SesameBot | Model::SesameBike | Model::Sesame4 => {
                Some(Handler::Os2(Os2Handler::new(model)))
            }
            Model::Sesame5
            | Model::SesameBike2
            | Model::Sesame5Pro
            | Model::OpenSensor1
            | Model::SesameTouchPro
            | Model::SesameTouch
            | Model::Remote
            | Model::RemoteNano
            | Model::SesameBot2
            | Model::SesameFacePro
            | Model::SesameFace => Some(Handler::Os3(Os3Handler::new(model))),
            _ => None,
        }
    }

    pub fn os_version(&self) -> OsVersion {
        match self {
            Handler::Os2(_) => OsVersion::Os2,
            Handler::Os3(_) => OsVersion::Os3,
        }
    }

    pub fn set_keys(
        &mut self,
        public_key: Option<&[u8; PK_SIZE]>,
        secret: &[u8; SECRET_SIZE],
    ) -> Result<(), HandlerError> {
        match self {
            Handler::Os2(h) => h.set_keys(public_key.ok_or(HandlerError::PublicKeyRequired)?, secret),
            Handler::Os3(h) => {
                h.set_keys(secret);
                Ok(())
            }
        }
    }

    /// 十六进制形式的密钥，OS3 忽略公钥
    pub fn set_keys_hex(&mut self, pk_hex: &str, secret_hex: &str) -> Result<(), HandlerError> {
        let secret: [u8; SECRET_SIZE] = hex_to_array(secret_hex)?;
        match self {
            Handler::Os2(h) => {
                let pk: [u8; PK_SIZE] = hex_to_array(pk_hex)?;
                h.set_keys(&pk, &secret)
            }
            Handler::Os3(h) => {
                h.set_keys(&secret);
                Ok(())
            }
        }
    }

    pub fn is_key_set(&self) -> bool {
        match self {
            Handler::Os2(h) => h.is_key_set(),
            Handler::Os3(h) => h.is_key_set(),
        }
    }

    fn parts(&mut self) -> (&mut Transport, &mut CryptSession) {
        match self {
            Handler::Os2(h) => (&mut h.transport, &mut h.crypt),
            Handler::Os3(h) => (&mut h.transport, &mut h.crypt),
        }
    }

    pub fn decode(&mut self, fragment: &[u8]) -> DecodeResult {
        let (transport, crypt) = self.parts();
        transport.decode(fragment, crypt)
    }

    pub fn transport(&self) -> &Transport {
        match self {
            Handler::Os2(h) => &h.transport,
            Handler::Os3(h) => &h.transport,
        }
    }

    pub fn crypt(&self) -> &CryptSession {
        match self {
            Handler::Os2(h) => &h.crypt,
            Handler::Os3(h) => &h.crypt,
        }
    }

    /// 丢弃接收缓冲与会话密钥
    pub fn reset(&mut self) {
        let (transport, crypt) = self.parts();
        transport.reset();
        crypt.reset();
    }

    pub fn send_command(
        &mut self,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
        encrypted: bool,
        write: &mut WriteFn<'_>,
    ) -> Result<(), HandlerError> {
        match self {
            Handler::Os2(h) => h.send_command(op, item, body, encrypted, write),
            Handler::Os3(h) => h.send_command(op, item, body, encrypted, write),
        }
    }

    pub fn max_history_tag_size(&self) -> usize {
        match self {
            Handler::Os2(_) => os2::MAX_HISTORY_TAG_SIZE,
            Handler::Os3(_) => os3::MAX_HISTORY_TAG_SIZE,
        }
    }

    /// 命令消息体中 tag 字段的长度
    pub fn cmd_tag_size(&self, tag_len: usize) -> usize {
        match self {
            Handler::Os2(_) => os2::MAX_HISTORY_TAG_SIZE + 1,
            Handler::Os3(_) => tag_len + 1,
        }
    }

    /// `[len][utf8...]`，超长时按字符边界截断
    pub fn tag_body(&self, model: Model, tag: &str) -> Vec<u8> {
        let tag = if model == Model::SesameBot2 {
            ""
        } else {
            truncate_utf8(tag, self.max_history_tag_size())
        };
        let mut body = vec![0u8; self.cmd_tag_size(tag.len())];
        body[0] = tag.len() as u8;
        body[1..=tag.len()].copy_from_slice(tag.as_bytes());
        body
    }

    /// 结构化触发来源: `[0][trigger][uuid16]`
    pub fn trigger_body(trigger: TriggerType, uuid: &[u8; HISTORY_TAG_UUID_SIZE]) -> Vec<u8> {
        let mut body = Vec::with_capacity(TRIGGER_TAG_SIZE);
        body.push(0);
        body.push(trigger as u8);
        body.extend_from_slice(uuid);
        body
    }

    pub fn handle_publish_initial(
        &mut self,
        body: &[u8],
        ctx: &mut CryptoContext,
        write: &mut WriteFn<'_>,
    ) -> Vec<HandlerEvent> {
        match self {
            Handler::Os2(h) => h.handle_publish_initial(body, ctx, write),
            Handler::Os3(h) => h.handle_publish_initial(body, write),
        }
    }

    pub fn handle_response_login(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        match self {
            Handler::Os2(h) => h.handle_response_login(body),
            Handler::Os3(h) => h.handle_response_login(body),
        }
    }

    pub fn handle_publish_mech_setting(
        &mut self,
        body: &[u8],
        state: ClientState,
    ) -> Vec<HandlerEvent> {
        match self {
            Handler::Os2(h) => h.handle_publish_mech_setting(body),
            Handler::Os3(h) => h.handle_publish_mech_setting(body, state),
        }
    }

    pub fn handle_publish_mech_status(
        &mut self,
        body: &[u8],
        state: ClientState,
    ) -> Vec<HandlerEvent> {
        match self {
            Handler::Os2(h) => h.handle_publish_mech_status(body),
            Handler::Os3(h) => h.handle_publish_mech_status(body, state),
        }
    }

    pub fn handle_response_mech_status(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        match self {
            Handler::Os2(h) => h.handle_response_mech_status(body),
            Handler::Os3(h) => h.handle_response_mech_status(body),
        }
    }

    pub fn handle_history(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        let history = match self {
            Handler::Os2(_) => Some(History::decode_os2(body)),
            Handler::Os3(_) => History::decode_os3(body),
        };
        history.map(HandlerEvent::History).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_selection() {
        assert!(matches!(Handler::for_model(Model::Sesame3), Some(Handler::Os2(_))));
        assert!(matches!(Handler::for_model(Model::SesameBot), Some(Handler::Os2(_))));
        assert!(matches!(Handler::for_model(Model::Sesame5), Some(Handler::Os3(_))));
        assert!(matches!(Handler::for_model(Model::SesameFace), Some(Handler::Os3(_))));
        assert!(Handler::for_model(Model::Wifi2).is_none());
        assert!(Handler::for_model(Model::Sesame6).is_none());
    }

    #[test]
    fn test_non_lock_models_rejected() {
        for model in [Model::Hub3, Model::BleConnector, Model::Sesame5Us] {
            assert_eq!(model.os_version(), OsVersion::Os3);
            assert!(Handler::for_model(model).is_none(), "{model}");
        }
        let accepted = Model::ALL
            .into_iter()
            .filter(|&m| Handler::for_model(m).is_some())
            .count();
        assert_eq!(accepted, 15);
    }

    #[test]
    fn test_tag_body_sizes() {
        let os2 = Handler::for_model(Model::Sesame4).unwrap();
        let body = os2.tag_body(Model::Sesame4, "hi");
        assert_eq!(body.len(), 22);
        assert_eq!(&body[..3], &[2, b'h', b'i']);
        assert!(body[3..].iter().all(|&b| b == 0));

        let os3 = Handler::for_model(Model::Sesame5).unwrap();
        assert_eq!(os3.tag_body(Model::Sesame5, "hi"), vec![2, b'h', b'i']);
        assert_eq!(os3.tag_body(Model::Sesame5, "").len(), 1);

        let long = "x".repeat(40);
        assert_eq!(os2.tag_body(Model::Sesame4, &long)[0], 21);
        assert_eq!(os3.tag_body(Model::Sesame5, &long).len(), 30);

        let bot2 = Handler::for_model(Model::SesameBot2).unwrap();
        assert_eq!(bot2.tag_body(Model::SesameBot2, "ignored"), vec![0]);
    }

    #[test]
    fn test_tag_body_respects_char_boundary() {
        let os2 = Handler::for_model(Model::Sesame3).unwrap();
        // 7 个 3 字节字符 = 21 字节，第 8 个放不下
        let tag = "あ".repeat(8);
        let body = os2.tag_body(Model::Sesame3, &tag);
        assert_eq!(body[0], 21);
        assert_eq!(std::str::from_utf8(&body[1..22]).unwrap(), "あ".repeat(7));
    }

    #[test]
    fn test_trigger_body() {
        let body = Handler::trigger_body(TriggerType::Remote, &[0xab; 16]);
        assert_eq!(body.len(), 18);
        assert_eq!(&body[..2], &[0, 10]);
    }

    #[test]
    fn test_set_keys_requirements() {
        let mut os2 = Handler::for_model(Model::Sesame3).unwrap();
        assert!(matches!(
            os2.set_keys(None, &[0; 16]),
            Err(HandlerError::PublicKeyRequired)
        ));
        assert!(!os2.is_key_set());
        assert!(matches!(
            os2.set_keys_hex("00", &"00".repeat(16)),
            Err(HandlerError::InvalidKeyFormat(_))
        ));

        let mut os3 = Handler::for_model(Model::Sesame5).unwrap();
        os3.set_keys(None, &[1; 16]).unwrap();
        assert!(os3.is_key_set());
        let mut os3 = Handler::for_model(Model::Sesame5).unwrap();
        os3.set_keys_hex("", &"ab".repeat(16)).unwrap();
        assert!(os3.is_key_set());
    }
}
