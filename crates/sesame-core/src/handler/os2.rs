//! OS2 (SESAME 3 / 4 / Bot / Bike)
//!
//! 登录流程:
//! 1. 设备推送 `publish/initial`，携带 4 字节 token
//! 2. 生成临时 P-256 密钥对，与设备公钥做 ECDH
//! 3. session_key = CMAC(ecdh[..16], local_tok || token)
//! 4. 明文发送 `sync/login`: ki(2) + 临时公钥(64) + local_tok(4) + CMAC(secret, ...)[..4]
//! 5. 设备以加密的 `response/login` 应答，携带设定与状态

use super::{ClientState, HandlerError, HandlerEvent, WriteFn};
use crate::crypto::{CryptSession, CryptoContext, CryptoError, Ecc, Role, aes_cmac, ecc};
use crate::protocol::{
    CMAC_TAG_SIZE, ItemCode, MAX_HISTORY_TAG_SIZE_OS2, Model, OpCode, OsVersion, PK_SIZE,
    ResultCode, SECRET_SIZE, Setting, Status, TOKEN_SIZE,
    mech::{MECH_SETTING_SIZE, MECH_STATUS_SIZE, MechSetting, MechStatus},
};
use crate::transport::Transport;

pub const MAX_HISTORY_TAG_SIZE: usize = MAX_HISTORY_TAG_SIZE_OS2;

/// 登录请求中固定为零的 key index
const SESAME_KI: [u8; 2] = [0, 0];
/// op2, result, timestamp, 4 字节未知字段
const LOGIN_HEADER_SIZE: usize = 10;
const LOGIN_RESPONSE_SIZE: usize = LOGIN_HEADER_SIZE + MECH_SETTING_SIZE + MECH_STATUS_SIZE;
/// `response/mech_status` 中状态前的前缀
const RESPONSE_STATUS_PREFIX: usize = 2;

pub struct Os2Handler {
    model: Model,
    pub(super) transport: Transport,
    pub(super) crypt: CryptSession,
    sesame_pk: Option<[u8; PK_SIZE]>,
    secret: Option<[u8; SECRET_SIZE]>,
}

impl Os2Handler {
    pub fn new(model: Model) -> Self {
        Self {
            model,
            transport: Transport::new(),
            crypt: CryptSession::new(OsVersion::Os2, Role::Central),
            sesame_pk: None,
            secret: None,
        }
    }

    pub fn set_keys(
        &mut self,
        public_key: &[u8; PK_SIZE],
        secret: &[u8; SECRET_SIZE],
    ) -> Result<(), HandlerError> {
        ecc::public_key_from_binary(public_key)?;
        self.sesame_pk = Some(*public_key);
        self.secret = Some(*secret);
        Ok(())
    }

    pub fn is_key_set(&self) -> bool {
        self.sesame_pk.is_some() && self.secret.is_some()
    }

    pub fn send_command(
        &mut self,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
        encrypted: bool,
        write: &mut WriteFn<'_>,
    ) -> Result<(), HandlerError> {
        Transport::send_message(
            &[op as u8, item as u8],
            body,
            encrypted,
            &mut self.crypt,
            write,
        )?;
        Ok(())
    }

    pub fn handle_publish_initial(
        &mut self,
        body: &[u8],
        ctx: &mut CryptoContext,
        write: &mut WriteFn<'_>,
    ) -> Vec<HandlerEvent> {
        let Some(token) = body.get(..TOKEN_SIZE).and_then(|t| <[u8; TOKEN_SIZE]>::try_from(t).ok())
        else {
            log::warn!("{}: short response initial data", body.len());
            return vec![HandlerEvent::Disconnect];
        };
        self.crypt.reset();
        match self.login(&token, ctx, write) {
            Ok(()) => vec![HandlerEvent::StateChanged(ClientState::Authenticating)],
            Err(e) => {
                log::warn!("Failed to start login: {e}");
                vec![HandlerEvent::Disconnect]
            }
        }
    }

    fn login(
        &mut self,
        token: &[u8; TOKEN_SIZE],
        ctx: &mut CryptoContext,
        write: &mut WriteFn<'_>,
    ) -> Result<(), HandlerError> {
        let (Some(sesame_pk), Some(secret)) = (self.sesame_pk, self.secret) else {
            return Err(HandlerError::KeyNotSet);
        };
        let local_tok = ctx.token();

        let mut ephemeral = Ecc::default();
        ephemeral.generate_keypair(ctx);
        let bpk = ephemeral.export_pk()?;
        let ssec = ephemeral.ecdh(&sesame_pk)?;
        let ssec_key: [u8; SECRET_SIZE] = ssec[..SECRET_SIZE]
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        let session_key = aes_cmac(&ssec_key, &[local_tok.as_slice(), token])?;
        self.crypt.set_session_key(&session_key, &local_tok, token)?;

        let tag = aes_cmac(&secret, &[SESAME_KI.as_slice(), &bpk, &local_tok, token])?;
        let mut resp = Vec::with_capacity(SESAME_KI.len() + PK_SIZE + TOKEN_SIZE + CMAC_TAG_SIZE);
        resp.extend_from_slice(&SESAME_KI);
        resp.extend_from_slice(&bpk);
        resp.extend_from_slice(&local_tok);
        resp.extend_from_slice(&tag[..CMAC_TAG_SIZE]);
        self.send_command(OpCode::Sync, ItemCode::Login, &resp, false, write)
    }

    pub fn handle_response_login(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        if body.len() < LOGIN_RESPONSE_SIZE {
            log::warn!("{}: short response login message", body.len());
            return vec![HandlerEvent::Disconnect];
        }
        let result = ResultCode::from_u8(body[1]);
        if result != ResultCode::Success {
            log::warn!("{result:?}: login response was not success");
            return vec![HandlerEvent::Disconnect];
        }
        let ts = u32::from_le_bytes([body[2], body[3], body[4], body[5]]);
        log::debug!("Login succeeded, device time={ts}");
        let mut events = Vec::with_capacity(3);
        if let Some(setting) = MechSetting::parse(&body[LOGIN_HEADER_SIZE..]) {
            events.push(HandlerEvent::Setting(Setting::from_os2(self.model, &setting)));
        }
        events.push(HandlerEvent::StateChanged(ClientState::Active));
        if let Some(status) = MechStatus::parse(&body[LOGIN_HEADER_SIZE + MECH_SETTING_SIZE..]) {
            events.push(HandlerEvent::Status(Status::from_os2(&status, self.model)));
        }
        events
    }

    pub fn handle_publish_mech_setting(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        match MechSetting::parse(body) {
            Some(setting) => vec![HandlerEvent::Setting(Setting::from_os2(self.model, &setting))],
            None => {
                log::warn!("{}: Unexpected size of mech setting, ignored", body.len());
                Vec::new()
            }
        }
    }

    pub fn handle_publish_mech_status(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        self.status_event(body)
    }

    pub fn handle_response_mech_status(&mut self, body: &[u8]) -> Vec<HandlerEvent> {
        self.status_event(body.get(RESPONSE_STATUS_PREFIX..).unwrap_or_default())
    }

    fn status_event(&self, body: &[u8]) -> Vec<HandlerEvent> {
        match MechStatus::parse(body) {
            Some(status) => vec![HandlerEvent::Status(Status::from_os2(&status, self.model))],
            None => {
                log::warn!("{}: Unexpected size of mech status, ignored", body.len());
                Vec::new()
            }
        }
    }
}
