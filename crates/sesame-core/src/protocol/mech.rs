//! 机械状态 / 设定的二进制编解码
//!
//! 线上结构为 packed 小端布局，这里用显式的字节偏移与位偏移访问，
//! 不依赖任何结构体内存布局。

use super::{Model, MotorStatus, OsVersion};

pub const MECH_SETTING_SIZE: usize = 12;
pub const MECH_SETTING5_SIZE: usize = 6;
pub const MECH_STATUS_SIZE: usize = 8;
pub const BOT2_STATUS_SIZE: usize = 3;
pub const MECH_STATUS5_SIZE: usize = 7;

fn le_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

fn le_i16(b: &[u8], off: usize) -> i16 {
    i16::from_le_bytes([b[off], b[off + 1]])
}

fn bit(flags: u8, n: u8) -> bool {
    flags & (1 << n) != 0
}

/// OS2 的 12 字节 mech setting，按型号解释为锁或 Bot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MechSetting([u8; MECH_SETTING_SIZE]);

impl MechSetting {
    pub fn parse(b: &[u8]) -> Option<Self> {
        let raw: [u8; MECH_SETTING_SIZE] = b.get(..MECH_SETTING_SIZE)?.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn as_bytes(&self) -> &[u8; MECH_SETTING_SIZE] {
        &self.0
    }

    pub fn lock_position(&self) -> i16 {
        le_i16(&self.0, 0)
    }

    pub fn unlock_position(&self) -> i16 {
        le_i16(&self.0, 2)
    }
}

/// OS3 的 6 字节 mech setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MechSetting5 {
    pub lock_position: i16,
    pub unlock_position: i16,
    pub auto_lock_sec: i16,
}

impl MechSetting5 {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < MECH_SETTING5_SIZE {
            return None;
        }
        Some(Self {
            lock_position: le_i16(b, 0),
            unlock_position: le_i16(b, 2),
            auto_lock_sec: le_i16(b, 4),
        })
    }

    pub fn to_bytes(&self) -> [u8; MECH_SETTING5_SIZE] {
        let mut out = [0u8; MECH_SETTING5_SIZE];
        out[0..2].copy_from_slice(&self.lock_position.to_le_bytes());
        out[2..4].copy_from_slice(&self.unlock_position.to_le_bytes());
        out[4..6].copy_from_slice(&self.auto_lock_sec.to_le_bytes());
        out
    }
}

/// OS2 的 8 字节 mech status
///
/// 锁视图: battery u16, target i16, position i16, retcode u8, flags u8。
/// Bot 视图: battery u16, (u16), motor_status u8, (2 字节), flags u8。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MechStatus([u8; MECH_STATUS_SIZE]);

impl MechStatus {
    pub fn parse(b: &[u8]) -> Option<Self> {
        let raw: [u8; MECH_STATUS_SIZE] = b.get(..MECH_STATUS_SIZE)?.try_into().ok()?;
        Some(Self(raw))
    }

    pub fn battery(&self) -> u16 {
        le_u16(&self.0, 0)
    }

    pub fn target(&self) -> i16 {
        le_i16(&self.0, 2)
    }

    pub fn position(&self) -> i16 {
        le_i16(&self.0, 4)
    }

    pub fn retcode(&self) -> u8 {
        self.0[6]
    }

    pub fn motor_status(&self) -> MotorStatus {
        MotorStatus::from_u8(self.0[4]).unwrap_or_default()
    }

    fn flags(&self) -> u8 {
        self.0[7]
    }

    /// Bot 视图专用
    pub fn not_stop(&self) -> bool {
        bit(self.flags(), 0)
    }

    pub fn in_lock(&self) -> bool {
        bit(self.flags(), 1)
    }

    pub fn in_unlock(&self) -> bool {
        bit(self.flags(), 2)
    }

    pub fn is_battery_critical(&self) -> bool {
        bit(self.flags(), 5)
    }
}

/// SESAME Bot 2 的 3 字节状态
///
/// 标志字节只有 bit2 (`is_idle`) 已知，没有锁定位置的信息。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Bot2Status {
    pub battery: u16,
    pub is_idle: bool,
}

impl Bot2Status {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < BOT2_STATUS_SIZE {
            return None;
        }
        Some(Self {
            battery: le_u16(b, 0),
            is_idle: bit(b[2], 2),
        })
    }
}

/// OS3 的 7 字节 mech status，服务端角色也用它编码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MechStatus5 {
    pub battery: i16,
    pub target: i16,
    pub position: i16,
    pub is_clutch_failed: bool,
    pub in_lock: bool,
    pub is_unlock_range: bool,
    pub is_critical: bool,
    pub is_stop: bool,
    pub is_battery_critical: bool,
    pub is_clockwise: bool,
}

impl MechStatus5 {
    pub fn parse(b: &[u8]) -> Option<Self> {
        if b.len() < MECH_STATUS5_SIZE {
            return None;
        }
        let flags = b[6];
        Some(Self {
            battery: le_i16(b, 0),
            target: le_i16(b, 2),
            position: le_i16(b, 4),
            is_clutch_failed: bit(flags, 0),
            in_lock: bit(flags, 1),
            is_unlock_range: bit(flags, 2),
            is_critical: bit(flags, 3),
            is_stop: bit(flags, 4),
            is_battery_critical: bit(flags, 5),
            is_clockwise: bit(flags, 6),
        })
    }

    pub fn to_bytes(&self) -> [u8; MECH_STATUS5_SIZE] {
        let mut out = [0u8; MECH_STATUS5_SIZE];
        out[0..2].copy_from_slice(&self.battery.to_le_bytes());
        out[2..4].copy_from_slice(&self.target.to_le_bytes());
        out[4..6].copy_from_slice(&self.position.to_le_bytes());
        let bits = [
            self.is_clutch_failed,
            self.in_lock,
            self.is_unlock_range,
            self.is_critical,
            self.is_stop,
            self.is_battery_critical,
            self.is_clockwise,
        ];
        out[6] = bits
            .iter()
            .enumerate()
            .fold(0u8, |acc, (i, &b)| acc | (u8::from(b) << i));
        out
    }
}

/// 锁类设备的设定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockSetting {
    pub lock_position: i16,
    pub unlock_position: i16,
    /// OS2 设备不提供，固定为 -1
    pub auto_lock_sec: i16,
}

impl From<&MechSetting> for LockSetting {
    fn from(s: &MechSetting) -> Self {
        Self {
            lock_position: s.lock_position(),
            unlock_position: s.unlock_position(),
            auto_lock_sec: -1,
        }
    }
}

impl From<&MechSetting5> for LockSetting {
    fn from(s: &MechSetting5) -> Self {
        Self {
            lock_position: s.lock_position,
            unlock_position: s.unlock_position,
            auto_lock_sec: s.auto_lock_sec,
        }
    }
}

/// SESAME Bot 的设定，时间单位均为 0.1 秒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BotSetting(MechSetting);

impl BotSetting {
    /// click 时的首个旋转方向 (0: push, 1: pull)
    pub fn user_pref_dir(&self) -> u8 {
        self.0.0[0]
    }

    pub fn lock_sec(&self) -> u8 {
        self.0.0[1]
    }

    pub fn unlock_sec(&self) -> u8 {
        self.0.0[2]
    }

    pub fn click_lock_sec(&self) -> u8 {
        self.0.0[3]
    }

    pub fn click_hold_sec(&self) -> u8 {
        self.0.0[4]
    }

    pub fn click_unlock_sec(&self) -> u8 {
        self.0.0[5]
    }

    pub fn button_mode(&self) -> u8 {
        self.0.0[6]
    }
}

impl From<&MechSetting> for BotSetting {
    fn from(s: &MechSetting) -> Self {
        Self(*s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    Lock(LockSetting),
    Bot(BotSetting),
}

impl Setting {
    /// 按型号解释 OS2 设定
    pub fn from_os2(model: Model, raw: &MechSetting) -> Self {
        if model == Model::SesameBot {
            Setting::Bot(raw.into())
        } else {
            Setting::Lock(raw.into())
        }
    }
}

struct BatteryPoint {
    voltage: f32,
    pct: f32,
}

const fn bp(voltage: f32, pct: f32) -> BatteryPoint {
    BatteryPoint { voltage, pct }
}

const BATTERY_TABLE: [BatteryPoint; 16] = [
    bp(5.85, 100.0),
    bp(5.82, 95.0),
    bp(5.79, 90.0),
    bp(5.76, 85.0),
    bp(5.73, 80.0),
    bp(5.70, 70.0),
    bp(5.65, 60.0),
    bp(5.60, 50.0),
    bp(5.55, 40.0),
    bp(5.50, 32.0),
    bp(5.40, 21.0),
    bp(5.20, 13.0),
    bp(5.10, 10.0),
    bp(5.0, 7.0),
    bp(4.8, 3.0),
    bp(4.6, 0.0),
];

const BATTERY_TABLE_OPEN_SENSOR: [BatteryPoint; 16] = [
    bp(5.820, 100.0),
    bp(5.810, 95.0),
    bp(5.755, 90.0),
    bp(5.735, 85.0),
    bp(5.665, 80.0),
    bp(5.620, 70.0),
    bp(5.585, 60.0),
    bp(5.556, 50.0),
    bp(5.550, 40.0),
    bp(5.530, 32.0),
    bp(5.450, 21.0),
    bp(5.400, 13.0),
    bp(5.320, 10.0),
    bp(5.280, 7.0),
    bp(5.225, 3.0),
    bp(5.150, 0.0),
];

/// 设备状态快照
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Status {
    pub voltage: f32,
    pub battery_pct: f32,
    pub target: i16,
    pub position: i16,
    pub ret_code: u8,
    pub in_lock: bool,
    pub in_unlock: bool,
    pub battery_critical: bool,
    /// SESAME 3 / 4 上无意义
    pub stopped: bool,
    pub is_critical: bool,
    pub is_clutch_failed: bool,
    /// 仅对 Bot (非 Bot 2) 有意义
    pub motor_status: MotorStatus,
}

impl Status {
    /// OS2 锁类状态
    pub fn from_lock(status: &MechStatus, model: Model) -> Self {
        let voltage = Self::os2_voltage(status.battery(), model);
        Self {
            voltage,
            battery_pct: Self::scaled_pct(voltage, model),
            target: status.target(),
            position: status.position(),
            ret_code: status.retcode(),
            in_lock: status.in_lock(),
            in_unlock: status.in_unlock(),
            battery_critical: status.is_battery_critical(),
            ..Self::default()
        }
    }

    /// OS2 Bot 状态
    pub fn from_bot(status: &MechStatus, model: Model) -> Self {
        let voltage = Self::os2_voltage(status.battery(), model);
        let motor_status = status.motor_status();
        Self {
            voltage,
            battery_pct: Self::scaled_pct(voltage, model),
            in_lock: status.in_lock(),
            in_unlock: status.in_unlock(),
            battery_critical: status.is_battery_critical(),
            stopped: matches!(motor_status, MotorStatus::Idle | MotorStatus::Holding),
            motor_status,
            ..Self::default()
        }
    }

    /// 按型号选择 OS2 的锁视图或 Bot 视图
    pub fn from_os2(status: &MechStatus, model: Model) -> Self {
        if model == Model::SesameBot {
            Self::from_bot(status, model)
        } else {
            Self::from_lock(status, model)
        }
    }

    /// Bot 2 不报告位置，`in_lock` 与 `in_unlock` 都为 false
    pub fn from_bot2(status: &Bot2Status, model: Model) -> Self {
        let voltage = Self::os3_voltage(status.battery as i16);
        Self {
            voltage,
            battery_pct: Self::scaled_pct(voltage, model),
            stopped: status.is_idle,
            ..Self::default()
        }
    }

    pub fn from_status5(status: &MechStatus5, model: Model) -> Self {
        let voltage = Self::os3_voltage(status.battery);
        Self {
            voltage,
            battery_pct: Self::scaled_pct(voltage, model),
            target: status.target,
            position: status.position,
            in_lock: status.in_lock,
            in_unlock: !status.in_lock,
            battery_critical: status.is_battery_critical,
            stopped: status.is_stop,
            is_critical: status.is_critical,
            is_clutch_failed: status.is_clutch_failed,
            ..Self::default()
        }
    }

    fn os2_voltage(battery: u16, model: Model) -> f32 {
        match model {
            Model::Sesame3 | Model::Sesame4 => f32::from(battery) * 7.2 / 1023.0,
            Model::SesameBike | Model::SesameBot => f32::from(battery) * 3.6 / 1023.0,
            _ => 0.0,
        }
    }

    fn os3_voltage(battery: i16) -> f32 {
        f32::from(battery) * 2.0 / 1000.0
    }

    /// 单节电池的型号换算到双节电池表
    fn voltage_scale(model: Model) -> f32 {
        match model {
            Model::SesameBike | Model::SesameBot | Model::SesameBike2 => 2.0,
            _ => 1.0,
        }
    }

    fn scaled_pct(voltage: f32, model: Model) -> f32 {
        if model.os_version() == OsVersion::Unknown {
            return 0.0;
        }
        Self::voltage_to_pct(voltage * Self::voltage_scale(model), Some(model))
    }

    /// 电压换算为剩余电量 (0-100%)，表内线性插值
    pub fn voltage_to_pct(voltage: f32, model: Option<Model>) -> f32 {
        let table: &[BatteryPoint] = if model == Some(Model::OpenSensor1) {
            &BATTERY_TABLE_OPEN_SENSOR
        } else {
            &BATTERY_TABLE
        };
        let first = &table[0];
        let last = &table[table.len() - 1];
        if voltage >= first.voltage {
            return first.pct;
        }
        if voltage <= last.voltage {
            return last.pct;
        }
        for pair in table.windows(2) {
            let (hi, lo) = (&pair[0], &pair[1]);
            if voltage >= lo.voltage {
                return (voltage - lo.voltage) / (hi.voltage - lo.voltage) * (hi.pct - lo.pct)
                    + lo.pct;
            }
        }
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn test_lock_status_offsets() {
        // battery=0x0300, target=-100, position=250, retcode=7, flags=in_lock|battery_critical
        let raw = hex!("0003 9cff fa00 07 22");
        let s = MechStatus::parse(&raw).unwrap();
        assert_eq!(s.battery(), 0x0300);
        assert_eq!(s.target(), -100);
        assert_eq!(s.position(), 250);
        assert_eq!(s.retcode(), 7);
        assert!(s.in_lock());
        assert!(!s.in_unlock());
        assert!(s.is_battery_critical());
        assert!(MechStatus::parse(&raw[..7]).is_none());
    }

    #[test]
    fn test_bot_status_view() {
        let raw = hex!("ff03 0000 02 0000 05");
        let status = Status::from_os2(&MechStatus::parse(&raw).unwrap(), Model::SesameBot);
        assert_eq!(status.motor_status, MotorStatus::Holding);
        assert!(status.stopped);
        assert!(!status.in_lock);
        assert!(status.in_unlock);
        // 1023 * 3.6 / 1023
        assert!((status.voltage - 3.6).abs() < 1e-4);
    }

    #[test]
    fn test_bot2_status_has_no_position() {
        // bit1 置位也不代表锁定
        let raw = Bot2Status::parse(&[0xb8, 0x0b, 0x06]).unwrap();
        assert_eq!(raw.battery, 3000);
        assert!(raw.is_idle);
        let status = Status::from_bot2(&raw, Model::SesameBot2);
        assert!(status.stopped);
        assert!(!status.in_lock);
        assert!(!status.in_unlock);
        assert!(Bot2Status::parse(&[0xb8, 0x0b]).is_none());
    }

    #[test]
    fn test_status5_roundtrip_flags() {
        let s = MechStatus5 {
            battery: 3000,
            target: -10,
            position: 20,
            in_lock: true,
            is_stop: true,
            is_clockwise: true,
            ..Default::default()
        };
        let raw = s.to_bytes();
        assert_eq!(raw[6], 0b0101_0010);
        assert_eq!(MechStatus5::parse(&raw), Some(s));
    }

    #[test]
    fn test_setting5_layout() {
        let raw = hex!("1000 f0ff 1e00");
        let s = MechSetting5::parse(&raw).unwrap();
        assert_eq!(s.lock_position, 16);
        assert_eq!(s.unlock_position, -16);
        assert_eq!(s.auto_lock_sec, 30);
        assert_eq!(s.to_bytes(), raw);
    }

    #[test]
    fn test_os2_setting_by_model() {
        let raw = MechSetting::parse(&hex!("01 02 03 04 05 06 07 00 00 00 00 00")).unwrap();
        match Setting::from_os2(Model::SesameBot, &raw) {
            Setting::Bot(b) => {
                assert_eq!(b.user_pref_dir(), 1);
                assert_eq!(b.click_hold_sec(), 5);
                assert_eq!(b.button_mode(), 7);
            }
            Setting::Lock(_) => panic!("bot expected"),
        }
        match Setting::from_os2(Model::Sesame3, &raw) {
            Setting::Lock(l) => {
                assert_eq!(l.lock_position, 0x0201);
                assert_eq!(l.auto_lock_sec, -1);
            }
            Setting::Bot(_) => panic!("lock expected"),
        }
    }

    #[test]
    fn test_voltage_to_pct() {
        assert_eq!(Status::voltage_to_pct(6.0, None), 100.0);
        assert_eq!(Status::voltage_to_pct(4.0, None), 0.0);
        assert!((Status::voltage_to_pct(5.55, None) - 40.0).abs() < 1e-3);
        // 5.45 位于 5.50(32%) 与 5.40(21%) 中点
        assert!((Status::voltage_to_pct(5.45, None) - 26.5).abs() < 1e-2);
        assert_eq!(Status::voltage_to_pct(5.15, Some(Model::OpenSensor1)), 0.0);
    }

    #[test]
    fn test_status5_voltage() {
        let s = MechStatus5 {
            battery: 2925,
            ..Default::default()
        };
        let status = Status::from_status5(&s, Model::Sesame5);
        assert!((status.voltage - 5.85).abs() < 1e-4);
        assert!((status.battery_pct - 100.0).abs() < 1e-3);
    }
}
