//! 日志级别
//!
//! 库本身只通过 `log` 门面输出，不安装任何 logger。
//! 二进制程序用 [`LogLevel::directive`] 构造 `EnvFilter`。

use serde::{Deserialize, Serialize};
use std::fmt;

/// 默认过滤规则 (未设置 `RUST_LOG` 时)
pub const DEFAULT_DIRECTIVE: &str = "info,sesame_core=debug";

/// 工作区内会输出日志的 crate
const WORKSPACE_TARGETS: [&str; 2] = ["sesame_core", "sesame"];

/// 日志级别
///
/// 实现了 `PartialOrd` 以便过滤。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    #[default]
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    /// 获取显示名称
    pub fn name(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    /// 依赖库保持在 warn，工作区 crate 使用本级别
    pub fn directive(self) -> String {
        let level = self.name().to_ascii_lowercase();
        let mut directive = String::from("warn");
        for target in WORKSPACE_TARGETS {
            directive.push_str(&format!(",{target}={level}"));
        }
        directive
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Unknown log level: {0}")]
pub struct ParseLogLevelError(String);

impl std::str::FromStr for LogLevel {
    type Err = ParseLogLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "ERROR" => Ok(LogLevel::Error),
            "WARN" | "WARNING" => Ok(LogLevel::Warn),
            "INFO" => Ok(LogLevel::Info),
            "DEBUG" => Ok(LogLevel::Debug),
            "TRACE" => Ok(LogLevel::Trace),
            _ => Err(ParseLogLevelError(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
