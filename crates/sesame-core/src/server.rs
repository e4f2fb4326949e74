//! SESAME 服务端 (peripheral) 核心
//!
//! 模拟一台 OS3 设备: 每个订阅通知的 central 占用一个会话槽，
//! 槽位只在 `on_disconnected` 之后才会复用。
//!
//! 会话状态: `Idle -> WaitingLogin -> Running`
//! - 订阅时发送 `publish/initial` (随机 nonce)
//! - 未注册时接受 `registration`，已注册时接受 `login`
//! - `WaitingLogin` 超过认证超时由 [`SesameServerCore::update`] 断开

use uuid::Uuid;

use crate::advertisement::{AdvertisementData, build_advertisement_os3};
use crate::crypto::{CryptSession, CryptoContext, CryptoError, Ecc, Role, aes_cmac};
use crate::protocol::{
    CMAC_TAG_SIZE, ItemCode, MechSetting5, MechStatus5, Model, OpCode, OsVersion, PK_SIZE,
    ResultCode, SECRET_SIZE, SK_SIZE, TOKEN_SIZE, TriggerType, parse_trigger_tag,
};
use crate::transport::{DecodeResult, Transport, TransportError};

pub const DEFAULT_AUTH_TIMEOUT_MS: u32 = 10_000;
pub const DEFAULT_MAX_SESSIONS: usize = 3;

/// 公钥 + 时间戳
const REGISTRATION_REQUEST_SIZE: usize = PK_SIZE + 4;

/// 服务端使用的 BLE 写出端，按会话区分 central
pub trait ServerBleBackend {
    fn write_to_central(&mut self, session_id: u16, data: &[u8]) -> bool;
    fn disconnect(&mut self, session_id: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    WaitingLogin,
    Running,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("begin() not finished")]
    NotStarted,
    #[error("Session {0} not found")]
    UnknownSession(u16),
    #[error("Session {0} already exists")]
    DuplicateSession(u16),
    #[error("Too many sessions")]
    TableFull,
    #[error("{item:?}: unexpected payload length {len}")]
    PayloadLength { item: ItemCode, len: usize },
    #[error("Already registered, registration ignored")]
    AlreadyRegistered,
    #[error("Registration callback not set")]
    NoRegistrationCallback,
    #[error("Session key is not shared yet")]
    KeyNotShared,
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("Session {0} is not running")]
    NotRunning(u16),
    #[error("Failed to notify {0} session(s)")]
    BroadcastFailed(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub type RegistrationCallback = Box<dyn FnMut(u16, &[u8; SECRET_SIZE])>;
/// `(session_id, item, tag, trigger)`，返回给 central 的结果码
pub type CommandCallback = Box<dyn FnMut(u16, ItemCode, &str, Option<TriggerType>) -> ResultCode>;

struct ServerSession {
    id: u16,
    transport: Transport,
    crypt: CryptSession,
    nonce: [u8; TOKEN_SIZE],
    state: SessionState,
    last_state_changed: u32,
}

impl ServerSession {
    fn new(id: u16, nonce: [u8; TOKEN_SIZE]) -> Self {
        Self {
            id,
            transport: Transport::new(),
            crypt: CryptSession::new(OsVersion::Os3, Role::Peripheral),
            nonce,
            state: SessionState::Idle,
            last_state_changed: 0,
        }
    }

    fn set_state(&mut self, state: SessionState, now_ms: u32) {
        if self.state == state {
            return;
        }
        log::debug!("Session {}: {:?} -> {state:?}", self.id, self.state);
        self.state = state;
        self.last_state_changed = now_ms;
    }

    /// 设备发出的帧总是 `[op][item][body]`
    fn notify<B: ServerBleBackend>(
        &mut self,
        backend: &mut B,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
        encrypted: bool,
    ) -> Result<(), TransportError> {
        let id = self.id;
        Transport::send_message(
            &[op as u8, item as u8],
            body,
            encrypted,
            &mut self.crypt,
            &mut |f: &[u8]| backend.write_to_central(id, f),
        )
    }
}

pub struct SesameServerCore<B: ServerBleBackend> {
    backend: B,
    ctx: CryptoContext,
    ecc: Ecc,
    model: Option<Model>,
    uuid: Uuid,
    registered: bool,
    secret: [u8; SECRET_SIZE],
    mech_status: MechStatus5,
    mech_setting: MechSetting5,
    sessions: Vec<Option<ServerSession>>,
    auth_timeout_ms: u32,
    now_ms: u32,
    /// (Unix 秒, 对应的 now_ms)
    wall_clock: Option<(u32, u32)>,
    registration_callback: Option<RegistrationCallback>,
    command_callback: Option<CommandCallback>,
}

impl<B: ServerBleBackend> SesameServerCore<B> {
    pub fn new(backend: B, max_sessions: usize) -> Result<Self, ServerError> {
        Ok(Self::with_context(backend, max_sessions, CryptoContext::new()?))
    }

    pub fn with_context(backend: B, max_sessions: usize, ctx: CryptoContext) -> Self {
        Self {
            backend,
            ctx,
            ecc: Ecc::default(),
            model: None,
            uuid: Uuid::nil(),
            registered: false,
            secret: [0u8; SECRET_SIZE],
            mech_status: MechStatus5::default(),
            mech_setting: MechSetting5::default(),
            sessions: (0..max_sessions).map(|_| None).collect(),
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            now_ms: 0,
            wall_clock: None,
            registration_callback: None,
            command_callback: None,
        }
    }

    /// 设定型号与 UUID，未载入私钥时生成新的密钥对
    pub fn begin(&mut self, model: Model, uuid: Uuid) {
        self.model = Some(model);
        self.uuid = uuid;
        if !self.ecc.has_keypair() {
            self.generate_keypair();
        }
        log::info!("Server started as {model} ({uuid})");
    }

    pub fn generate_keypair(&mut self) {
        self.ecc.generate_keypair(&mut self.ctx);
    }

    pub fn load_key(&mut self, sk: &[u8; SK_SIZE]) -> Result<(), ServerError> {
        self.ecc.load_key(sk)?;
        Ok(())
    }

    /// (公钥 64 字节, 私钥 32 字节)
    pub fn export_keypair(&self) -> Result<([u8; PK_SIZE], [u8; SK_SIZE]), ServerError> {
        Ok((self.ecc.export_pk()?, self.ecc.export_sk()?))
    }

    pub fn set_registered(&mut self, secret: &[u8; SECRET_SIZE]) {
        self.secret = *secret;
        self.registered = true;
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn set_mech_status(&mut self, status: MechStatus5) {
        self.mech_status = status;
    }

    pub fn set_mech_setting(&mut self, setting: MechSetting5) {
        self.mech_setting = setting;
    }

    pub fn set_authentication_timeout(&mut self, timeout_ms: u32) {
        self.auth_timeout_ms = timeout_ms;
    }

    /// 以 `now_ms` 时刻的 Unix 时间校准时钟，之后按 `now_ms` 推算
    pub fn set_current_time(&mut self, unix_secs: u32, now_ms: u32) {
        self.now_ms = now_ms;
        self.wall_clock = Some((unix_secs, now_ms));
    }

    /// 当前 Unix 时间，未校准时为 0
    pub fn current_time(&self) -> u32 {
        self.wall_clock.map_or(0, |(secs, at_ms)| {
            secs.wrapping_add(self.now_ms.wrapping_sub(at_ms) / 1000)
        })
    }

    pub fn set_registration_callback(&mut self, cb: impl FnMut(u16, &[u8; SECRET_SIZE]) + 'static) {
        self.registration_callback = Some(Box::new(cb));
    }

    pub fn set_command_callback(
        &mut self,
        cb: impl FnMut(u16, ItemCode, &str, Option<TriggerType>) -> ResultCode + 'static,
    ) {
        self.command_callback = Some(Box::new(cb));
    }

    pub fn session_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_some()).count()
    }

    pub fn has_session(&self, session_id: u16) -> bool {
        self.find(session_id).is_some()
    }

    pub fn session_state(&self, session_id: u16) -> Option<SessionState> {
        self.find(session_id)
            .and_then(|idx| self.sessions[idx].as_ref())
            .map(|s| s.state)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn create_advertisement_data_os3(&self) -> Result<AdvertisementData, ServerError> {
        let model = self.model.ok_or(ServerError::NotStarted)?;
        Ok(build_advertisement_os3(model, self.registered, &self.uuid))
    }

    fn find(&self, session_id: u16) -> Option<usize> {
        self.sessions
            .iter()
            .position(|s| s.as_ref().is_some_and(|s| s.id == session_id))
    }

    /// central 订阅了通知: 分配会话并发送 `publish/initial`
    pub fn on_subscribed(&mut self, session_id: u16, now_ms: u32) -> Result<(), ServerError> {
        self.now_ms = now_ms;
        if self.model.is_none() {
            return Err(ServerError::NotStarted);
        }
        if self.has_session(session_id) {
            return Err(ServerError::DuplicateSession(session_id));
        }
        let idx = self
            .sessions
            .iter()
            .position(Option::is_none)
            .ok_or(ServerError::TableFull)?;
        let mut session = ServerSession::new(session_id, self.ctx.token());
        log::debug!("Session {session_id} created");

        let nonce = session.nonce;
        let sent = session.notify(&mut self.backend, OpCode::Publish, ItemCode::Initial, &nonce, false);
        let result = sent.map_err(ServerError::from).and_then(|()| {
            if self.registered {
                self.prepare_session_key(&mut session)?;
            }
            session.set_state(SessionState::WaitingLogin, now_ms);
            Ok(())
        });
        self.sessions[idx] = Some(session);
        result
    }

    pub fn on_disconnected(&mut self, session_id: u16) {
        match self.find(session_id) {
            Some(idx) => {
                self.sessions[idx] = None;
                log::debug!("Session {session_id} cleared");
            }
            None => log::debug!("Session {session_id} not found (on_disconnected)"),
        }
    }

    /// 喂入某个 central 写入的分片
    pub fn on_received(&mut self, session_id: u16, fragment: &[u8]) -> Result<(), ServerError> {
        let idx = self
            .find(session_id)
            .ok_or(ServerError::UnknownSession(session_id))?;
        let Some(mut session) = self.sessions[idx].take() else {
            return Err(ServerError::UnknownSession(session_id));
        };
        let result = self.handle_fragment(&mut session, fragment);
        self.sessions[idx] = Some(session);
        result
    }

    fn handle_fragment(&mut self, session: &mut ServerSession, fragment: &[u8]) -> Result<(), ServerError> {
        match session.transport.decode(fragment, &mut session.crypt) {
            DecodeResult::Received => {}
            DecodeResult::Skipping if session.transport.last_decrypt_failed() => {
                self.drop_session(session);
                return Err(ServerError::AuthenticationFailed);
            }
            _ => return Ok(()),
        }
        let data = session.transport.data().to_vec();
        let Some((&code, payload)) = data.split_first() else {
            log::debug!("Too short command ignored");
            return Ok(());
        };
        match ItemCode::try_from(code) {
            Ok(ItemCode::Registration) => self.handle_registration(session, payload),
            Ok(ItemCode::Login) => self.handle_login(session, payload),
            Ok(
                item @ (ItemCode::Lock | ItemCode::Unlock | ItemCode::DoorOpen | ItemCode::DoorClosed),
            ) => self.handle_cmd_with_tag(session, item, payload),
            _ => {
                log::debug!("Unhandled command {code} {}", hex::encode(payload));
                Ok(())
            }
        }
    }

    /// 断开链路并丢弃会话密钥，槽位保留到 `on_disconnected`
    fn drop_session(&mut self, session: &mut ServerSession) {
        self.backend.disconnect(session.id);
        session.transport.reset();
        session.crypt.reset();
        session.set_state(SessionState::Idle, self.now_ms);
    }

    fn prepare_session_key(&self, session: &mut ServerSession) -> Result<(), ServerError> {
        let key = aes_cmac(&self.secret, &[session.nonce.as_slice()])?;
        session.crypt.set_session_key(&key, &session.nonce, &[0; TOKEN_SIZE])?;
        Ok(())
    }

    fn handle_registration(&mut self, session: &mut ServerSession, payload: &[u8]) -> Result<(), ServerError> {
        if payload.len() != REGISTRATION_REQUEST_SIZE {
            return Err(ServerError::PayloadLength {
                item: ItemCode::Registration,
                len: payload.len(),
            });
        }
        if self.registered {
            log::warn!("Already registered, registration ignored");
            return Err(ServerError::AlreadyRegistered);
        }
        if self.registration_callback.is_none() {
            log::warn!("Registration callback not set, abort registration");
            return Err(ServerError::NoRegistrationCallback);
        }
        let mut peer_pk = [0u8; PK_SIZE];
        peer_pk.copy_from_slice(&payload[..PK_SIZE]);
        let ts = u32::from_le_bytes([payload[64], payload[65], payload[66], payload[67]]);
        log::debug!("Registration request, time={ts}");

        self.secret = self.ecc.derive_secret(&peer_pk)?;
        self.prepare_session_key(session)?;

        let mut resp = Vec::with_capacity(1 + 7 + 6 + PK_SIZE);
        resp.push(ResultCode::Success as u8);
        resp.extend_from_slice(&self.mech_status.to_bytes());
        resp.extend_from_slice(&self.mech_setting.to_bytes());
        resp.extend_from_slice(&self.ecc.export_pk()?);
        session.notify(&mut self.backend, OpCode::Response, ItemCode::Registration, &resp, false)?;

        self.registered = true;
        session.set_state(SessionState::Running, self.now_ms);
        log::info!("Session {}: registration done", session.id);
        if let Some(cb) = self.registration_callback.as_mut() {
            cb(session.id, &self.secret);
        }
        Ok(())
    }

    fn handle_login(&mut self, session: &mut ServerSession, payload: &[u8]) -> Result<(), ServerError> {
        if payload.len() != CMAC_TAG_SIZE {
            return Err(ServerError::PayloadLength {
                item: ItemCode::Login,
                len: payload.len(),
            });
        }
        if !session.crypt.is_key_shared() {
            log::warn!("Session {}: login in invalid state", session.id);
            return Err(ServerError::KeyNotShared);
        }
        if !session.crypt.verify_auth_code(payload) {
            log::warn!("Session {}: authentication failed", session.id);
            self.drop_session(session);
            return Err(ServerError::AuthenticationFailed);
        }
        let mut resp = [ResultCode::Success as u8, 0, 0, 0, 0];
        resp[1..].copy_from_slice(&self.current_time().to_le_bytes());
        session.notify(&mut self.backend, OpCode::Response, ItemCode::Login, &resp, true)?;
        session.set_state(SessionState::Running, self.now_ms);
        log::info!("Session {}: logged in", session.id);

        let status = self.mech_status.to_bytes();
        if let Err(e) = session.notify(&mut self.backend, OpCode::Publish, ItemCode::MechStatus, &status, true) {
            log::warn!("Failed to send mecha status: {e}");
        }
        let setting = self.mech_setting.to_bytes();
        if let Err(e) = session.notify(&mut self.backend, OpCode::Publish, ItemCode::MechSetting, &setting, true) {
            log::warn!("Failed to send mecha setting: {e}");
        }
        Ok(())
    }

    /// 标签为 `[len][utf8]` 或 `[0][trigger][uuid16]`
    fn handle_cmd_with_tag(
        &mut self,
        session: &mut ServerSession,
        item: ItemCode,
        payload: &[u8],
    ) -> Result<(), ServerError> {
        if session.state != SessionState::Running {
            log::warn!("Session {}: {item:?} refused before login", session.id);
            return Err(ServerError::NotRunning(session.id));
        }
        let Some(&tag_len) = payload.first() else {
            return Err(ServerError::PayloadLength { item, len: 0 });
        };
        let tag_len = usize::from(tag_len);
        if payload.len() < tag_len + 1 {
            return Err(ServerError::PayloadLength {
                item,
                len: payload.len(),
            });
        }
        let (tag, trigger) = if tag_len > 0 {
            (String::from_utf8_lossy(&payload[1..=tag_len]).into_owned(), None)
        } else if let Some((trigger, tag)) = parse_trigger_tag(payload) {
            (tag, trigger)
        } else {
            (String::new(), None)
        };
        log::debug!("Session {}: cmd={item:?}({tag})", session.id);

        let result = match self.command_callback.as_mut() {
            Some(cb) => cb(session.id, item, &tag, trigger),
            None => ResultCode::NotSupported,
        };
        session.notify(&mut self.backend, OpCode::Response, item, &[result as u8], true)?;
        Ok(())
    }

    /// 周期调用: 断开登录超时的会话
    pub fn update(&mut self, now_ms: u32) {
        self.now_ms = now_ms;
        let timeout = self.auth_timeout_ms;
        for slot in &mut self.sessions {
            let Some(session) = slot.as_mut() else {
                continue;
            };
            if session.state == SessionState::WaitingLogin
                && now_ms.wrapping_sub(session.last_state_changed) > timeout
            {
                log::info!("Session {} login timeout", session.id);
                self.backend.disconnect(session.id);
                session.transport.reset();
                session.crypt.reset();
                session.set_state(SessionState::Idle, now_ms);
            }
        }
    }

    /// 发送加密通知，`None` 表示广播给所有已登录的会话
    pub fn send_notify(
        &mut self,
        session_id: Option<u16>,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
    ) -> Result<(), ServerError> {
        if let Some(id) = session_id {
            let session = self
                .sessions
                .iter_mut()
                .flatten()
                .find(|s| s.id == id)
                .ok_or(ServerError::UnknownSession(id))?;
            session.notify(&mut self.backend, op, item, body, true)?;
            return Ok(());
        }
        let mut failed = 0;
        for session in self.sessions.iter_mut().flatten() {
            if session.state != SessionState::Running {
                continue;
            }
            if let Err(e) = session.notify(&mut self.backend, op, item, body, true) {
                log::warn!("Session {}: failed to send notify: {e}", session.id);
                failed += 1;
            }
        }
        if failed > 0 {
            return Err(ServerError::BroadcastFailed(failed));
        }
        Ok(())
    }
}
