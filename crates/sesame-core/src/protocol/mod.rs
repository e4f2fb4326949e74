//! SESAME 协议目录
//!
//! 固定长度常量、型号与各类线上编码 (op/item/result/history/trigger)。
//! 所有多字节字段均为小端序，结构体无填充。

pub mod history;
pub mod mech;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub use history::History;
pub use mech::{
    Bot2Status, BotSetting, LockSetting, MechSetting, MechSetting5, MechStatus, MechStatus5,
    Setting, Status,
};

pub const TOKEN_SIZE: usize = 4;
pub const COMPANY_ID: u16 = 0x055a;
pub const PK_SIZE: usize = 64;
pub const SK_SIZE: usize = 32;
pub const SECRET_SIZE: usize = 16;
pub const CMAC_TAG_SIZE: usize = 4;
pub const MAX_CMD_TAG_SIZE_OS2: usize = 21;
pub const MAX_CMD_TAG_SIZE_OS3: usize = 29;
pub const MAX_CMD_TAG_SIZE_OS3_EXTENDED: usize = 32;
pub const MAX_HISTORY_TAG_SIZE_OS2: usize = 21;
pub const MAX_HISTORY_TAG_SIZE_OS3: usize = 29;
pub const HISTORY_TAG_UUID_SIZE: usize = 16;
/// 结构化标签 `[0][trigger][uuid16]` 的总长
pub const TRIGGER_TAG_SIZE: usize = 2 + HISTORY_TAG_UUID_SIZE;

const _: () = assert!(HISTORY_TAG_UUID_SIZE * 2 == MAX_CMD_TAG_SIZE_OS3_EXTENDED);

/// 解析 `[0][trigger][uuid16]`，UUID 以十六进制文本作为标签
///
/// 只接受恰好 18 字节的形式；未知的触发来源仍返回标签。
pub fn parse_trigger_tag(data: &[u8]) -> Option<(Option<TriggerType>, String)> {
    if data.len() != TRIGGER_TAG_SIZE || data[0] != 0 {
        return None;
    }
    Some((TriggerType::try_from(data[1]).ok(), hex::encode(&data[2..])))
}

/// 广播中的 16-bit Service UUID
pub const SERVICE_UUID_16: u16 = 0xfd81;
pub const TX_CHAR_UUID: Uuid = Uuid::from_u128(0x16860002_a5ae_9856_b6d3_dbb4c676993e);
pub const RX_CHAR_UUID: Uuid = Uuid::from_u128(0x16860003_a5ae_9856_b6d3_dbb4c676993e);

/// 协议代际
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OsVersion {
    Unknown,
    Os2,
    Os3,
}

/// 设备型号
///
/// 线上编码为有符号字节，`-1` 表示未知，由 `Option<Model>` 表达。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Model {
    #[serde(rename = "sesame_3")]
    Sesame3,
    #[serde(rename = "wifi_2")]
    Wifi2,
    #[serde(rename = "sesame_bot")]
    SesameBot,
    #[serde(rename = "sesame_bike")]
    SesameBike,
    #[serde(rename = "sesame_4")]
    Sesame4,
    #[serde(rename = "sesame_5")]
    Sesame5,
    #[serde(rename = "sesame_bike_2")]
    SesameBike2,
    #[serde(rename = "sesame_5_pro")]
    Sesame5Pro,
    #[serde(rename = "open_sensor_1")]
    OpenSensor1,
    #[serde(rename = "sesame_touch_pro")]
    SesameTouchPro,
    #[serde(rename = "sesame_touch")]
    SesameTouch,
    #[serde(rename = "ble_connector")]
    BleConnector,
    #[serde(rename = "hub3")]
    Hub3,
    #[serde(rename = "remote")]
    Remote,
    #[serde(rename = "remote_nano")]
    RemoteNano,
    #[serde(rename = "sesame_5_us")]
    Sesame5Us,
    #[serde(rename = "sesame_bot_2")]
    SesameBot2,
    #[serde(rename = "sesame_face_pro")]
    SesameFacePro,
    #[serde(rename = "sesame_face")]
    SesameFace,
    #[serde(rename = "sesame_6")]
    Sesame6,
    #[serde(rename = "sesame_6_pro")]
    Sesame6Pro,
}

impl Model {
    pub const ALL: [Model; 21] = [
        Model::Sesame3,
        Model::Wifi2,
        Model::SesameBot,
        Model::SesameBike,
        Model::Sesame4,
        Model::Sesame5,
        Model::SesameBike2,
        Model::Sesame5Pro,
        Model::OpenSensor1,
        Model::SesameTouchPro,
        Model::SesameTouch,
        Model::BleConnector,
        Model::Hub3,
        Model::Remote,
        Model::RemoteNano,
        Model::Sesame5Us,
        Model::SesameBot2,
        Model::SesameFacePro,
        Model::SesameFace,
        Model::Sesame6,
        Model::Sesame6Pro,
    ];

    /// 线上编码
    pub fn code(self) -> i8 {
        match self {
            Model::Sesame3 => 0,
            Model::Wifi2 => 1,
            Model::SesameBot => 2,
            Model::SesameBike => 3,
            Model::Sesame4 => 4,
            Model::Sesame5 => 5,
            Model::SesameBike2 => 6,
            Model::Sesame5Pro => 7,
            Model::OpenSensor1 => 8,
            Model::SesameTouchPro => 9,
            Model::SesameTouch => 10,
            Model::BleConnector => 11,
            Model::Hub3 => 13,
            Model::Remote => 14,
            Model::RemoteNano => 15,
            Model::Sesame5Us => 16,
            Model::SesameBot2 => 17,
            Model::SesameFacePro => 18,
            Model::SesameFace => 19,
            Model::Sesame6 => 20,
            Model::Sesame6Pro => 21,
        }
    }

    /// 从线上编码创建，未定义的编码返回 `None`
    pub fn from_code(code: i8) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Model::Sesame3 => "sesame_3",
            Model::Wifi2 => "wifi_2",
            Model::SesameBot => "sesame_bot",
            Model::SesameBike => "sesame_bike",
            Model::Sesame4 => "sesame_4",
            Model::Sesame5 => "sesame_5",
            Model::SesameBike2 => "sesame_bike_2",
            Model::Sesame5Pro => "sesame_5_pro",
            Model::OpenSensor1 => "open_sensor_1",
            Model::SesameTouchPro => "sesame_touch_pro",
            Model::SesameTouch => "sesame_touch",
            Model::BleConnector => "ble_connector",
            Model::Hub3 => "hub3",
            Model::Remote => "remote",
            Model::RemoteNano => "remote_nano",
            Model::Sesame5Us => "sesame_5_us",
            Model::SesameBot2 => "sesame_bot_2",
            Model::SesameFacePro => "sesame_face_pro",
            Model::SesameFace => "sesame_face",
            Model::Sesame6 => "sesame_6",
            Model::Sesame6Pro => "sesame_6_pro",
        }
    }

    /// 按编码区间判断协议代际
    ///
    /// 0..=4 为 OS2，超过 `sesame_face` 的编码视为未知。
    pub fn os_version(self) -> OsVersion {
        let v = self.code();
        if v < 0 || v > Model::SesameFace.code() {
            OsVersion::Unknown
        } else if v <= Model::Sesame4.code() {
            OsVersion::Os2
        } else {
            OsVersion::Os3
        }
    }

    /// 该型号是否会推送 mech setting
    pub fn has_setting(self) -> bool {
        !matches!(
            self,
            Model::OpenSensor1
                | Model::SesameTouch
                | Model::SesameTouchPro
                | Model::Remote
                | Model::RemoteNano
                | Model::SesameBot2
                | Model::SesameFacePro
                | Model::SesameFace
        )
    }
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Model {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|m| m.name() == lower)
            .ok_or_else(|| format!("unknown model: {s}"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Create = 1,
    Read = 2,
    Update = 3,
    Delete = 4,
    Sync = 5,
    Async = 6,
    Response = 7,
    Publish = 8,
    Undefine = 16,
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            1 => OpCode::Create,
            2 => OpCode::Read,
            3 => OpCode::Update,
            4 => OpCode::Delete,
            5 => OpCode::Sync,
            6 => OpCode::Async,
            7 => OpCode::Response,
            8 => OpCode::Publish,
            16 => OpCode::Undefine,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemCode {
    None = 0,
    Registration = 1,
    Login = 2,
    User = 3,
    History = 4,
    VersionTag = 5,
    DisconnectRebootNow = 6,
    EnableDfu = 7,
    Time = 8,
    BleConnectionParam = 9,
    BleAdvParam = 10,
    Autolock = 11,
    ServerAdvKick = 12,
    SsmToken = 13,
    Initial = 14,
    Irer = 15,
    TimePhone = 16,
    MechSetting = 80,
    MechStatus = 81,
    Lock = 82,
    Unlock = 83,
    MoveTo = 84,
    DriveDirection = 85,
    Stop = 86,
    DetectDir = 87,
    Toggle = 88,
    Click = 89,
    DoorOpen = 90,
    DoorClosed = 91,
    AddSesame = 101,
    PubSsmKey = 102,
    RemoveSesame = 103,
}

impl TryFrom<u8> for ItemCode {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => ItemCode::None,
            1 => ItemCode::Registration,
            2 => ItemCode::Login,
            3 => ItemCode::User,
            4 => ItemCode::History,
            5 => ItemCode::VersionTag,
            6 => ItemCode::DisconnectRebootNow,
            7 => ItemCode::EnableDfu,
            8 => ItemCode::Time,
            9 => ItemCode::BleConnectionParam,
            10 => ItemCode::BleAdvParam,
            11 => ItemCode::Autolock,
            12 => ItemCode::ServerAdvKick,
            13 => ItemCode::SsmToken,
            14 => ItemCode::Initial,
            15 => ItemCode::Irer,
            16 => ItemCode::TimePhone,
            80 => ItemCode::MechSetting,
            81 => ItemCode::MechStatus,
            82 => ItemCode::Lock,
            83 => ItemCode::Unlock,
            84 => ItemCode::MoveTo,
            85 => ItemCode::DriveDirection,
            86 => ItemCode::Stop,
            87 => ItemCode::DetectDir,
            88 => ItemCode::Toggle,
            89 => ItemCode::Click,
            90 => ItemCode::DoorOpen,
            91 => ItemCode::DoorClosed,
            101 => ItemCode::AddSesame,
            102 => ItemCode::PubSsmKey,
            103 => ItemCode::RemoveSesame,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ResultCode {
    #[default]
    Success = 0,
    InvalidFormat = 1,
    NotSupported = 2,
    StorageFail = 3,
    InvalidSig = 4,
    NotFound = 5,
    Unknown = 6,
    Busy = 7,
    InvalidParam = 8,
}

impl ResultCode {
    /// 未定义的编码归为 `Unknown`
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => ResultCode::Success,
            1 => ResultCode::InvalidFormat,
            2 => ResultCode::NotSupported,
            3 => ResultCode::StorageFail,
            4 => ResultCode::InvalidSig,
            5 => ResultCode::NotFound,
            7 => ResultCode::Busy,
            8 => ResultCode::InvalidParam,
            _ => ResultCode::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum HistoryType {
    #[default]
    None = 0,
    BleLock = 1,
    BleUnlock = 2,
    TimeChanged = 3,
    AutolockUpdated = 4,
    MechSettingUpdated = 5,
    Autolock = 6,
    ManualLocked = 7,
    ManualUnlocked = 8,
    ManualElse = 9,
    DriveLocked = 10,
    DriveUnlocked = 11,
    DriveFailed = 12,
    BleAdvParamUpdated = 13,
    Wm2Lock = 14,
    Wm2Unlock = 15,
    WebLock = 16,
    WebUnlock = 17,
    BleClick = 18,
    DriveClicked = 21,
}

impl TryFrom<u8> for HistoryType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => HistoryType::None,
            1 => HistoryType::BleLock,
            2 => HistoryType::BleUnlock,
            3 => HistoryType::TimeChanged,
            4 => HistoryType::AutolockUpdated,
            5 => HistoryType::MechSettingUpdated,
            6 => HistoryType::Autolock,
            7 => HistoryType::ManualLocked,
            8 => HistoryType::ManualUnlocked,
            9 => HistoryType::ManualElse,
            10 => HistoryType::DriveLocked,
            11 => HistoryType::DriveUnlocked,
            12 => HistoryType::DriveFailed,
            13 => HistoryType::BleAdvParamUpdated,
            14 => HistoryType::Wm2Lock,
            15 => HistoryType::Wm2Unlock,
            16 => HistoryType::WebLock,
            17 => HistoryType::WebUnlock,
            18 => HistoryType::BleClick,
            21 => HistoryType::DriveClicked,
            other => return Err(other),
        })
    }
}

/// 历史记录 / 命令标签中的触发来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerType {
    IcCard = 0,
    FaceFinger = 1,
    Face = 3,
    FaceVein = 4,
    TouchFinger = 6,
    OpenSensor = 7,
    FaceClose = 9,
    Remote = 10,
    RemoteNano = 11,
    AndroidBle = 14,
    AndroidWifi = 16,
}

impl TryFrom<u8> for TriggerType {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Ok(match v {
            0 => TriggerType::IcCard,
            1 => TriggerType::FaceFinger,
            3 => TriggerType::Face,
            4 => TriggerType::FaceVein,
            6 => TriggerType::TouchFinger,
            7 => TriggerType::OpenSensor,
            9 => TriggerType::FaceClose,
            10 => TriggerType::Remote,
            11 => TriggerType::RemoteNano,
            14 => TriggerType::AndroidBle,
            16 => TriggerType::AndroidWifi,
            other => return Err(other),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MotorStatus {
    #[default]
    Idle = 0,
    Locking = 1,
    Holding = 2,
    Unlocking = 3,
}

impl MotorStatus {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(MotorStatus::Idle),
            1 => Some(MotorStatus::Locking),
            2 => Some(MotorStatus::Holding),
            3 => Some(MotorStatus::Unlocking),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_tag_form() {
        let mut data = vec![0, TriggerType::Remote as u8];
        data.extend_from_slice(&[0xab; HISTORY_TAG_UUID_SIZE]);
        let (trigger, tag) = parse_trigger_tag(&data).unwrap();
        assert_eq!(trigger, Some(TriggerType::Remote));
        assert_eq!(tag.len(), MAX_CMD_TAG_SIZE_OS3_EXTENDED);
        assert_eq!(tag, "ab".repeat(16));

        // 长度不符或首字节非零都不是结构化标签
        assert!(parse_trigger_tag(&data[..17]).is_none());
        data.push(0);
        assert!(parse_trigger_tag(&data).is_none());
        data.pop();
        data[0] = 1;
        assert!(parse_trigger_tag(&data).is_none());
    }

    #[test]
    fn test_model_codes_roundtrip() {
        for m in Model::ALL {
            assert_eq!(Model::from_code(m.code()), Some(m));
            assert_eq!(m.name().parse::<Model>().unwrap(), m);
        }
        assert_eq!(Model::from_code(-1), None);
        assert_eq!(Model::from_code(12), None);
        assert_eq!(Model::from_code(22), None);
    }

    #[test]
    fn test_os_version_ranges() {
        assert_eq!(Model::Sesame3.os_version(), OsVersion::Os2);
        assert_eq!(Model::Sesame4.os_version(), OsVersion::Os2);
        // wifi_2 落在 OS2 区间内
        assert_eq!(Model::Wifi2.os_version(), OsVersion::Os2);
        assert_eq!(Model::Sesame5.os_version(), OsVersion::Os3);
        assert_eq!(Model::SesameFace.os_version(), OsVersion::Os3);
        assert_eq!(Model::Sesame6.os_version(), OsVersion::Unknown);
        assert_eq!(Model::Sesame6Pro.os_version(), OsVersion::Unknown);
    }

    #[test]
    fn test_has_setting() {
        assert!(Model::Sesame5.has_setting());
        assert!(Model::SesameBot.has_setting());
        assert!(!Model::SesameBot2.has_setting());
        assert!(!Model::SesameTouch.has_setting());
    }

    #[test]
    fn test_model_serde_name() {
        #[derive(Serialize, Deserialize)]
        struct Wrap {
            model: Model,
        }
        let w: Wrap = toml::from_str("model = \"sesame_5_pro\"").unwrap();
        assert_eq!(w.model, Model::Sesame5Pro);
        assert_eq!(
            toml::to_string(&Wrap {
                model: Model::SesameBike2
            })
            .unwrap()
            .trim(),
            "model = \"sesame_bike_2\""
        );
    }

    #[test]
    fn test_code_conversions() {
        assert_eq!(OpCode::try_from(8), Ok(OpCode::Publish));
        assert_eq!(OpCode::try_from(9), Err(9));
        assert_eq!(ItemCode::try_from(102), Ok(ItemCode::PubSsmKey));
        assert_eq!(ResultCode::from_u8(200), ResultCode::Unknown);
        assert_eq!(HistoryType::try_from(21), Ok(HistoryType::DriveClicked));
        assert!(HistoryType::try_from(19).is_err());
        assert_eq!(TriggerType::try_from(14), Ok(TriggerType::AndroidBle));
    }
}
