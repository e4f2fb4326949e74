//! 设置与持久化
//!
//! 保存已知设备的密钥和模拟设备 (服务端) 的参数。
//! 核心类型不会隐式读取设置，由调用方 (如 CLI) 取出后传入。

use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use uuid::Uuid;

use crate::protocol::{Model, PK_SIZE, SECRET_SIZE, SK_SIZE};
use crate::server::{DEFAULT_AUTH_TIMEOUT_MS, DEFAULT_MAX_SESSIONS};
use crate::util::{KeyParseError, hex_to_array};

/// 已知设备
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,
    pub model: Model,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    /// 32 个十六进制字符
    pub secret: String,
    /// OS2 设备公钥，128 个十六进制字符
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
}

impl DeviceProfile {
    pub fn secret_bytes(&self) -> Result<[u8; SECRET_SIZE], KeyParseError> {
        hex_to_array(&self.secret)
    }

    pub fn public_key_bytes(&self) -> Result<Option<[u8; PK_SIZE]>, KeyParseError> {
        self.public_key.as_deref().map(hex_to_array).transpose()
    }
}

/// 模拟设备参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub model: Model,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    pub max_sessions: usize,
    pub auth_timeout_ms: u32,
    /// P-256 私钥，64 个十六进制字符
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    /// 注册后得到的 secret
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            model: Model::Sesame5,
            uuid: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT_MS,
            private_key: None,
            secret: None,
        }
    }
}

impl ServerSettings {
    pub fn private_key_bytes(&self) -> Result<Option<[u8; SK_SIZE]>, KeyParseError> {
        self.private_key.as_deref().map(hex_to_array).transpose()
    }

    pub fn secret_bytes(&self) -> Result<Option<[u8; SECRET_SIZE]>, KeyParseError> {
        self.secret.as_deref().map(hex_to_array).transpose()
    }
}

/// 应用设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SesameSettings {
    /// 日志级别 (error / warn / info / debug / trace)
    pub log_level: String,
    pub devices: Vec<DeviceProfile>,
    pub server: ServerSettings,
}

impl Default for SesameSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            devices: Vec::new(),
            server: ServerSettings::default(),
        }
    }
}

impl SesameSettings {
    /// 配置文件路径
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("sesame")
            .join("settings.toml")
    }

    /// 加载设置（文件不存在或无效时使用默认值）
    pub fn load() -> Self {
        let path = Self::config_path();
        if path.exists() {
            match fs::read_to_string(&path) {
                Ok(content) => match Self::from_toml(&content) {
                    Ok(settings) => {
                        debug!("Loaded settings from {}", path.display());
                        return settings;
                    }
                    Err(e) => log::warn!("Failed to parse settings: {e}, using defaults"),
                },
                Err(e) => log::warn!("Failed to read settings file: {e}, using defaults"),
            }
        }
        Self::default()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, self.to_toml()?)?;
        debug!("Saved settings to {}", path.display());
        Ok(())
    }

    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn device(&self, name: &str) -> Option<&DeviceProfile> {
        self.devices.iter().find(|d| d.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = SesameSettings::default();
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.server.model, Model::Sesame5);
        assert_eq!(settings.server.max_sessions, 3);
        assert_eq!(settings.server.auth_timeout_ms, 10_000);
        assert!(settings.devices.is_empty());
    }

    #[test]
    fn test_parse_partial_file() {
        let content = r#"
log_level = "debug"

[[devices]]
name = "front door"
model = "sesame_5"
uuid = "00112233-4455-6677-8899-aabbccddeeff"
secret = "000102030405060708090a0b0c0d0e0f"

[[devices]]
name = "garage"
model = "sesame_4"
secret = "ffffffffffffffffffffffffffffffff"
public_key = "zz"

[server]
auth_timeout_ms = 3000
"#;
        let settings = SesameSettings::from_toml(content).unwrap();
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.server.auth_timeout_ms, 3000);
        assert_eq!(settings.server.max_sessions, 3);

        let door = settings.device("front door").unwrap();
        assert_eq!(door.model, Model::Sesame5);
        assert_eq!(door.secret_bytes().unwrap()[15], 0x0f);
        assert_eq!(door.public_key_bytes().unwrap(), None);

        let garage = settings.device("garage").unwrap();
        assert!(garage.public_key_bytes().is_err());
        assert!(settings.device("attic").is_none());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut settings = SesameSettings::default();
        settings.server.private_key = Some("11".repeat(32));
        settings.devices.push(DeviceProfile {
            name: "bot".to_string(),
            model: Model::SesameBot2,
            uuid: None,
            secret: "22".repeat(16),
            public_key: None,
        });
        let text = settings.to_toml().unwrap();
        assert!(text.contains("sesame_bot_2"));
        let parsed = SesameSettings::from_toml(&text).unwrap();
        assert_eq!(parsed, settings);
        assert_eq!(parsed.server.private_key_bytes().unwrap(), Some([0x11; 32]));
        assert_eq!(parsed.server.secret_bytes().unwrap(), None);
    }

    #[test]
    fn test_secret_length_checked() {
        let profile = DeviceProfile {
            name: "x".to_string(),
            model: Model::Sesame5,
            uuid: None,
            secret: "0011".to_string(),
            public_key: None,
        };
        assert!(profile.secret_bytes().is_err());
    }
}
