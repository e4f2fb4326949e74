//! SESAME 客户端 (central) 核心
//!
//! 不直接依赖任何 BLE 栈: 通知数据通过 [`SesameClientCore::on_received`] 喂入，
//! 写出的分片交给 [`SesameBleBackend`]。
//!
//! 流程:
//! 1. `begin(model)` 按型号选择 OS2 / OS3 处理器
//! 2. `set_keys` 设置设备公钥 (仅 OS2) 与 secret
//! 3. 连接并订阅通知后，设备推送 `publish/initial`，自动完成登录
//! 4. 进入 `Active` 后可发送 lock / unlock / click 等命令

use base64::{Engine as _, engine::general_purpose};
use uuid::Uuid;

use crate::crypto::{CryptoContext, CryptoError};
use crate::handler::{Handler, HandlerError, HandlerEvent};
use crate::protocol::{
    HISTORY_TAG_UUID_SIZE, History, ItemCode, Model, OpCode, OsVersion, PK_SIZE, SECRET_SIZE,
    Setting, Status, TriggerType,
};
use crate::transport::DecodeResult;

pub use crate::handler::ClientState;

const REGISTERED_DEVICE_DATA_SIZE: usize = 23;
const OS2_UUID_B64_LEN: usize = 22;

/// 客户端使用的 BLE 写出端
pub trait SesameBleBackend {
    /// 向 TX characteristic 写入一个分片
    fn write_to_tx(&mut self, data: &[u8]) -> bool;
    fn disconnect(&mut self);
}

/// 设备上登记的其他设备
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredDevice {
    pub uuid: Uuid,
    pub os_version: OsVersion,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("begin() not finished")]
    NotInitialized,
    #[error("Model not supported: {0}")]
    UnsupportedModel(Model),
    #[error("Cannot operate while session is not active")]
    NotActive,
    #[error("{op} is not supported on {model}")]
    NotSupported { op: &'static str, model: Model },
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type StateCallback = Box<dyn FnMut(ClientState)>;
pub type StatusCallback = Box<dyn FnMut(&Status)>;
pub type HistoryCallback = Box<dyn FnMut(&History)>;
pub type RegisteredDevicesCallback = Box<dyn FnMut(&[RegisteredDevice])>;

pub struct SesameClientCore<B: SesameBleBackend> {
    backend: B,
    ctx: CryptoContext,
    model: Option<Model>,
    handler: Option<Handler>,
    state: ClientState,
    setting: Option<Setting>,
    status: Status,
    state_callback: Option<StateCallback>,
    status_callback: Option<StatusCallback>,
    history_callback: Option<HistoryCallback>,
    registered_devices_callback: Option<RegisteredDevicesCallback>,
}

impl<B: SesameBleBackend> SesameClientCore<B> {
    pub fn new(backend: B) -> Result<Self, ClientError> {
        Ok(Self::with_context(backend, CryptoContext::new()?))
    }

    /// 指定随机数来源
    pub fn with_context(backend: B, ctx: CryptoContext) -> Self {
        Self {
            backend,
            ctx,
            model: None,
            handler: None,
            state: ClientState::Idle,
            setting: None,
            status: Status::default(),
            state_callback: None,
            status_callback: None,
            history_callback: None,
            registered_devices_callback: None,
        }
    }

    pub fn begin(&mut self, model: Model) -> Result<(), ClientError> {
        let handler = Handler::for_model(model).ok_or(ClientError::UnsupportedModel(model))?;
        log::debug!("Client initialized for {model} ({:?})", handler.os_version());
        self.model = Some(model);
        self.handler = Some(handler);
        self.setting = None;
        self.status = Status::default();
        self.state = ClientState::Idle;
        Ok(())
    }

    /// OS2 需要设备公钥，OS3 忽略公钥
    pub fn set_keys(
        &mut self,
        public_key: Option<&[u8; PK_SIZE]>,
        secret: &[u8; SECRET_SIZE],
    ) -> Result<(), ClientError> {
        let handler = self.handler.as_mut().ok_or(ClientError::NotInitialized)?;
        handler.set_keys(public_key, secret)?;
        Ok(())
    }

    pub fn set_keys_hex(&mut self, pk_hex: &str, secret_hex: &str) -> Result<(), ClientError> {
        let handler = self.handler.as_mut().ok_or(ClientError::NotInitialized)?;
        handler.set_keys_hex(pk_hex, secret_hex)?;
        Ok(())
    }

    pub fn is_key_set(&self) -> bool {
        self.handler.as_ref().is_some_and(Handler::is_key_set)
    }

    pub fn model(&self) -> Option<Model> {
        self.model
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn is_session_active(&self) -> bool {
        self.state == ClientState::Active
    }

    pub fn setting(&self) -> Option<&Setting> {
        self.setting.as_ref()
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    pub fn has_setting(&self) -> bool {
        self.model.is_some_and(Model::has_setting)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn set_state_callback(&mut self, cb: impl FnMut(ClientState) + 'static) {
        self.state_callback = Some(Box::new(cb));
    }

    pub fn set_status_callback(&mut self, cb: impl FnMut(&Status) + 'static) {
        self.status_callback = Some(Box::new(cb));
    }

    /// 只有设置了回调才会解码 `response/history`
    pub fn set_history_callback(&mut self, cb: impl FnMut(&History) + 'static) {
        self.history_callback = Some(Box::new(cb));
    }

    pub fn set_registered_devices_callback(
        &mut self,
        cb: impl FnMut(&[RegisteredDevice]) + 'static,
    ) {
        self.registered_devices_callback = Some(Box::new(cb));
    }

    /// 主动断开: 通知后端并丢弃会话
    pub fn disconnect(&mut self) {
        self.backend.disconnect();
        if let Some(handler) = self.handler.as_mut() {
            handler.reset();
        }
        self.update_state(ClientState::Idle);
    }

    /// 后端报告连接已断开
    pub fn on_disconnected(&mut self) {
        if let Some(handler) = self.handler.as_mut() {
            handler.reset();
        }
        if self.state != ClientState::Idle {
            log::info!("Bluetooth disconnected by peer");
            self.update_state(ClientState::Idle);
        }
    }

    /// 喂入一个 RX 通知分片
    pub fn on_received(&mut self, fragment: &[u8]) {
        let Some(handler) = self.handler.as_mut() else {
            log::warn!("begin() not finished");
            return;
        };
        match handler.decode(fragment) {
            DecodeResult::Received => {}
            DecodeResult::Skipping if handler.transport().last_decrypt_failed() => {
                log::warn!("Message authentication failed, disconnecting");
                self.disconnect();
                return;
            }
            _ => return,
        }
        let data = handler.transport().data().to_vec();
        if data.len() < 2 {
            log::debug!("too short message dropped");
            return;
        }
        let body = &data[2..];
        let events = match (OpCode::try_from(data[0]), ItemCode::try_from(data[1])) {
            (Ok(OpCode::Publish), Ok(item)) => self.handle_publish(item, body),
            (Ok(OpCode::Response), Ok(item)) => self.handle_response(item, body),
            (Ok(op), Ok(item)) => {
                log::debug!("{op:?}/{item:?}: Unexpected op code");
                Vec::new()
            }
            _ => {
                log::debug!("Unsupported message: {}", hex::encode(&data));
                Vec::new()
            }
        };
        self.apply(events);
    }

    fn handle_publish(&mut self, item: ItemCode, body: &[u8]) -> Vec<HandlerEvent> {
        if item == ItemCode::PubSsmKey {
            self.handle_pub_ssm_key(body);
            return Vec::new();
        }
        let state = self.state;
        let Self {
            handler,
            backend,
            ctx,
            ..
        } = self;
        let Some(handler) = handler.as_mut() else {
            return Vec::new();
        };
        match item {
            ItemCode::Initial => {
                if state == ClientState::Authenticating {
                    log::debug!("skipped repeating initial");
                    return Vec::new();
                }
                handler.handle_publish_initial(body, ctx, &mut |f: &[u8]| backend.write_to_tx(f))
            }
            ItemCode::MechSetting => handler.handle_publish_mech_setting(body, state),
            ItemCode::MechStatus => handler.handle_publish_mech_status(body, state),
            other => {
                log::debug!("{other:?}: Unsupported item on publish: {}", hex::encode(body));
                Vec::new()
            }
        }
    }

    fn handle_response(&mut self, item: ItemCode, body: &[u8]) -> Vec<HandlerEvent> {
        let has_history_cb = self.history_callback.is_some();
        let Some(handler) = self.handler.as_mut() else {
            return Vec::new();
        };
        match item {
            ItemCode::Login => handler.handle_response_login(body),
            ItemCode::MechStatus => handler.handle_response_mech_status(body),
            ItemCode::History if has_history_cb => handler.handle_history(body),
            ItemCode::History => Vec::new(),
            other => {
                log::debug!("{other:?}: Unsupported item on response: {}", hex::encode(body));
                Vec::new()
            }
        }
    }

    fn apply(&mut self, events: Vec<HandlerEvent>) {
        for event in events {
            match event {
                HandlerEvent::Disconnect => {
                    self.disconnect();
                    return;
                }
                HandlerEvent::StateChanged(state) => self.update_state(state),
                HandlerEvent::Setting(setting) => self.setting = Some(setting),
                HandlerEvent::Status(status) => {
                    self.status = status;
                    if let Some(cb) = self.status_callback.as_mut() {
                        cb(&status);
                    }
                }
                HandlerEvent::History(history) => {
                    if let Some(cb) = self.history_callback.as_mut() {
                        cb(&history);
                    }
                }
            }
        }
    }

    fn update_state(&mut self, state: ClientState) {
        if self.state == state {
            return;
        }
        log::debug!("State {:?} -> {state:?}", self.state);
        self.state = state;
        if let Some(cb) = self.state_callback.as_mut() {
            cb(state);
        }
    }

    fn handle_pub_ssm_key(&mut self, body: &[u8]) {
        let Some(cb) = self.registered_devices_callback.as_mut() else {
            return;
        };
        let devices = parse_registered_devices(body);
        cb(&devices);
    }

    fn active_model(&self) -> Result<Model, ClientError> {
        let model = self.model.ok_or(ClientError::NotInitialized)?;
        if !self.is_session_active() {
            log::warn!("Cannot operate while session is not active");
            return Err(ClientError::NotActive);
        }
        Ok(model)
    }

    fn send_command(
        &mut self,
        op: OpCode,
        item: ItemCode,
        body: &[u8],
        encrypted: bool,
    ) -> Result<(), ClientError> {
        let Self {
            handler, backend, ..
        } = self;
        let handler = handler.as_mut().ok_or(ClientError::NotInitialized)?;
        handler.send_command(op, item, body, encrypted, &mut |f: &[u8]| backend.write_to_tx(f))?;
        Ok(())
    }

    fn send_cmd_with_tag(&mut self, item: ItemCode, tag: &str) -> Result<(), ClientError> {
        let model = self.model.ok_or(ClientError::NotInitialized)?;
        let handler = self.handler.as_ref().ok_or(ClientError::NotInitialized)?;
        let body = handler.tag_body(model, tag);
        self.send_command(OpCode::Async, item, &body, true)
    }

    pub fn unlock(&mut self, tag: &str) -> Result<(), ClientError> {
        self.active_model()?;
        self.send_cmd_with_tag(ItemCode::Unlock, tag)
    }

    pub fn lock(&mut self, tag: &str) -> Result<(), ClientError> {
        if self.model == Some(Model::SesameBike) {
            return Err(ClientError::NotSupported {
                op: "lock",
                model: Model::SesameBike,
            });
        }
        self.active_model()?;
        self.send_cmd_with_tag(ItemCode::Lock, tag)
    }

    /// SESAME Bot 专用
    pub fn click(&mut self, tag: &str) -> Result<(), ClientError> {
        let model = self.model.ok_or(ClientError::NotInitialized)?;
        if model != Model::SesameBot {
            return Err(ClientError::NotSupported { op: "click", model });
        }
        self.active_model()?;
        self.send_cmd_with_tag(ItemCode::Click, tag)
    }

    /// 执行 Bot / Bot 2 的脚本
    ///
    /// Bot 上脚本 0 等同于 unlock，脚本 1 等同于 lock，其余为 click。
    pub fn click_script(&mut self, script_no: Option<u8>) -> Result<(), ClientError> {
        let model = self.model.ok_or(ClientError::NotInitialized)?;
        if !matches!(model, Model::SesameBot | Model::SesameBot2) {
            return Err(ClientError::NotSupported {
                op: "click",
                model,
            });
        }
        self.active_model()?;
        if model == Model::SesameBot {
            match script_no {
                Some(0) => self.unlock(""),
                Some(1) => self.lock(""),
                _ => self.send_cmd_with_tag(ItemCode::Click, ""),
            }
        } else {
            let body: Vec<u8> = script_no.into_iter().collect();
            self.send_command(OpCode::Async, ItemCode::Click, &body, true)
        }
    }

    fn send_with_trigger(
        &mut self,
        item: ItemCode,
        op: &'static str,
        trigger: TriggerType,
        uuid: &[u8; HISTORY_TAG_UUID_SIZE],
    ) -> Result<(), ClientError> {
        let model = self.active_model()?;
        if model.os_version() != OsVersion::Os3 {
            return Err(ClientError::NotSupported { op, model });
        }
        self.send_command(OpCode::Async, item, &Handler::trigger_body(trigger, uuid), true)
    }

    /// 以触发来源 + UUID 代替文本标签 (仅 OS3)
    pub fn lock_with_trigger(
        &mut self,
        trigger: TriggerType,
        uuid: &[u8; HISTORY_TAG_UUID_SIZE],
    ) -> Result<(), ClientError> {
        self.send_with_trigger(ItemCode::Lock, "lock_with_trigger", trigger, uuid)
    }

    pub fn unlock_with_trigger(
        &mut self,
        trigger: TriggerType,
        uuid: &[u8; HISTORY_TAG_UUID_SIZE],
    ) -> Result<(), ClientError> {
        self.send_with_trigger(ItemCode::Unlock, "unlock_with_trigger", trigger, uuid)
    }

    pub fn request_history(&mut self) -> Result<(), ClientError> {
        self.active_model()?;
        self.send_command(OpCode::Read, ItemCode::History, &[0], true)
    }

    pub fn request_status(&mut self) -> Result<(), ClientError> {
        self.active_model()?;
        self.send_command(OpCode::Read, ItemCode::MechStatus, &[], true)
    }
}

/// `publish/pub_ssm_key` 的 23 字节记录序列
pub fn parse_registered_devices(body: &[u8]) -> Vec<RegisteredDevice> {
    body.chunks_exact(REGISTERED_DEVICE_DATA_SIZE)
        .filter(|rec| rec[22] != 0)
        .filter_map(|rec| {
            if rec[21] == 0 {
                let uuid = Uuid::from_slice(&rec[..16]).ok()?;
                return Some(RegisteredDevice {
                    uuid,
                    os_version: OsVersion::Os3,
                });
            }
            let mut b64 = rec[..OS2_UUID_B64_LEN].to_vec();
            b64.extend_from_slice(b"==");
            let decoded = match general_purpose::STANDARD.decode(&b64) {
                Ok(d) if d.len() == 16 => d,
                _ => {
                    log::debug!(
                        "{}: Failed to decode registered device (OS2)",
                        hex::encode(&b64)
                    );
                    return None;
                }
            };
            Some(RegisteredDevice {
                uuid: Uuid::from_slice(&decoded).ok()?,
                os_version: OsVersion::Os2,
            })
        })
        .collect()
}
