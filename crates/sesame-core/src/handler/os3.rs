//! OS3 (SESAME 5 系列、Bot 2、Touch、Remote 等)
//!
//! session_key = CMAC(secret, token)，登录请求只携带其前 4 字节。
//! 登录应答之后，设备依次推送设定与状态，两者都收到才进入 active。

use super::{ClientState, HandlerError, HandlerEvent, WriteFn};
use crate::crypto::{CryptSession, Role, aes_cmac};
use crate::protocol::{
    Bot2Status, CMAC_TAG_SIZE, ItemCode, LockSetting, MAX_HISTORY_TAG_SIZE_OS3, MechSetting5,
    MechStatus5, Model, OpCode, OsVersion, ResultCode, SECRET_SIZE, Setting, Status, TOKEN_SIZE,
};
use crate::transport::Transport;

pub const MAX_HISTORY_TAG_SIZE: usize = MAX_HISTORY_TAG_SIZE_OS3;

/// result + timestamp
const LOGIN_RESPONSE_SIZE: usize = 5;

pub struct Os3Handler {
    model: Model,
    pub(super) transport: Transport,
    pub(super) crypt: CryptSession,
    secret: Option<[u8; SECRET_SIZE]>,
    setting_received: bool,
    status_received: bool,
}

impl Os3Handler {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            transport: Transport::new(),
            crypt: CryptSession::new(OsVersion::Os3, Role::Central),
            secret: None,
            setting_received: false,
            status_received: false,
        }
    }

    pub fn set_keys(&mut self, secret: &[u8; SECRET_SIZE]) {
        self.secret = Some(*secret);
    }

    pub fn is_key_set(&self) -> bool {
        self.secret.is_some()
    }

    /// 中心端发出的帧只有 item，op 仅用于日志
    pub fn send_command(
        &mut self,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
        encrypted: bool,
        write: &mut WriteFn<'_>,
    ) -> Result<(), HandlerError> {
        log::debug!("Sending {op:?}/{item:?} ({} bytes)", body.len());
        Transport::send_message(&[item as u8], body, encrypted, &mut self.crypt, write)?;
        Ok(())
    }

    pub fn handle_publish_initial(
        &mut self,
        body: &[u8],
        write: &mut WriteFn<'_>,
    ) -> Vec<HandlerEvent> {
        let Some(token) = body.get(..TOKEN_SIZE).and_then(|t| <[u8; TOKEN_SIZE]>::try_from(t).ok())
        else {
            log::warn!("{}: short response initial data", body.len());
            return vec![HandlerEvent::Disconnect];
        };
        match self.login(&token, write) {
            Ok(()) => vec![HandlerEvent::StateChanged(ClientState::Authenticating)],
            Err(e) => {
                log::warn!("Failed to start login: {e}");
                vec![HandlerEvent::Disconnect]
            }
        }
    }

    fn login(&mut self, token: &[u8; TOKEN_SIZE], write: &mut WriteFn<'_>) -> Result<(), HandlerError> {
        let secret = self.secret.ok_or(HandlerError::KeyNotSet)?;
        let session_key = aes_cmac(&secret, &[token.as_slice()])?;
        self.crypt
            .set_session_key(&session_key, &[0; TOKEN_SIZE], token)?;
        self.send_command(
            OpCode::Async,
            ItemCode::Login,
            &session_key[..CMAC_TAG_SIZE],
            false,
            write,
        )
    }

    pub fn handle_response_login(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        if body.len() < LOGIN_RESPONSE_SIZE {
            log::warn!("{}: short response login message", body.len());
            return vec![HandlerEvent::Disconnect];
        }
        let result = ResultCode::from_u8(body[0]);
        if result != ResultCode::Success {
            log::warn!("{result:?}: login response was not success");
            return vec![HandlerEvent::Disconnect];
        }
        let ts = u32::from_le_bytes([body[1], body[2], body[3], body[4]]);
        log::debug!("Login succeeded, device time={ts}");
        // 无设定的型号视为已收到设定
        self.setting_received = !self.model.has_setting();
        self.status_received = false;
        Vec::new()
    }

    fn activation(&self, state: ClientState) -> Option<HandlerEvent> {
        (state != ClientState::Active && self.setting_received && self.status_received)
            .then_some(HandlerEvent::StateChanged(ClientState::Active))
    }

    pub fn handle_publish_mech_setting(
        &mut self,
        body: &[u8],
        state: ClientState,
    ) -> Vec<HandlerEvent> {
        let Some(setting) = MechSetting5::parse(body) else {
            log::warn!("{}: Unexpected size of mech setting, ignored", body.len());
            return Vec::new();
        };
        self.setting_received = true;
        let mut events = vec![HandlerEvent::Setting(Setting::Lock(LockSetting::from(&setting)))];
        events.extend(self.activation(state));
        events
    }

    pub fn handle_publish_mech_status(
        &mut self,
        body: &[u8],
        state: ClientState,
    ) -> Vec<HandlerEvent> {
        let Some(status) = self.decode_status(body) else {
            return Vec::new();
        };
        self.status_received = true;
        let mut events = vec![HandlerEvent::Status(status)];
        events.extend(self.activation(state));
        events
    }

    /// 应答首字节为 result
    pub fn handle_response_mech_status(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        body.get(1..)
            .and_then(|b| self.decode_status(b))
            .map(HandlerEvent::Status)
            .into_iter()
            .collect()
    }

    fn decode_status(&self, body: &[u8]) -> Option<Status> {
        let status = if self.model == Model::SesameBot2 {
            Bot2Status::parse(body).map(|s| Status::from_bot2(&s, self.model))
        } else {
            MechStatus5::parse(body).map(|s| Status::from_status5(&s, self.model))
        };
        if status.is_none() {
            log::warn!("{}: Unexpected size of mech status, ignored", body.len());
        }
        status
    }
}
