//! SESAME Core Library
//!
//! CANDY HOUSE SESAME 智能锁 BLE 协议引擎，不依赖具体的蓝牙栈
//!
//! # 模块
//!
//! - **transport**: 20 字节分片的收发与重组
//! - **crypto**: AES-CCM 会话、IV 管理、CMAC 与 P-256 ECDH
//! - **handler**: OS2 / OS3 两代协议的登录与消息解码
//! - **client**: 作为 central 控制设备
//! - **server**: 作为 peripheral 模拟 OS3 设备
//! - **advertisement**: 广播数据解析/构造与 BLE 地址推导
//!
//! 所有操作都是同步的，在调用方线程上执行完毕；同一个核心实例需由调用方串行访问。
//!
//! # 使用示例
//!
//! ```ignore
//! use sesame_core::{Model, SesameBleBackend, SesameClientCore};
//!
//! struct Link { /* BLE 连接 */ }
//!
//! impl SesameBleBackend for Link {
//!     fn write_to_tx(&mut self, data: &[u8]) -> bool { /* 写入 TX characteristic */ true }
//!     fn disconnect(&mut self) {}
//! }
//!
//! let mut client = SesameClientCore::new(Link { })?;
//! client.begin(Model::Sesame5)?;
//! client.set_keys_hex("", "0123456789abcdef0123456789abcdef")?;
//! client.set_state_callback(|state| println!("state: {state:?}"));
//!
//! // RX characteristic 的每个通知
//! client.on_received(&notification);
//!
//! // 进入 Active 之后
//! client.unlock("from rust")?;
//! ```

pub mod advertisement;
pub mod client;
pub mod config;
pub mod crypto;
pub mod handler;
pub mod logging;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod util;

// Client re-exports
pub use client::{
    ClientError, ClientState, RegisteredDevice, SesameBleBackend, SesameClientCore,
    parse_registered_devices,
};

// Server re-exports
pub use server::{ServerBleBackend, ServerError, SesameServerCore, SessionState};

// Protocol re-exports
pub use protocol::{
    History, HistoryType, ItemCode, LockSetting, MechSetting5, MechStatus5, Model, OpCode,
    OsVersion, ResultCode, Setting, Status, TriggerType,
};

pub use advertisement::{
    Advertisement, AdvertisementData, AdvertisementError, build_advertisement_os3,
    format_ble_address, parse_advertisement, uuid_to_ble_address,
};
pub use config::{DeviceProfile, ServerSettings, SesameSettings};
pub use crypto::{CryptoContext, CryptoError};
pub use logging::LogLevel;
pub use transport::{DecodeResult, Transport};
