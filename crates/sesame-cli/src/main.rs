//! SESAME CLI
//!
//! 协议调试工具：BLE 地址推导、广播解析、报文解密以及内存回环模拟

mod decode;
mod simulate;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use sesame_core::crypto::{CryptoContext, Ecc};
use sesame_core::logging::DEFAULT_DIRECTIVE;
use sesame_core::{
    LogLevel, Model, SesameSettings, build_advertisement_os3, format_ble_address,
    parse_advertisement, uuid_to_ble_address,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "sesame", version, about = "SESAME 智能锁 BLE 协议工具")]
struct Cli {
    /// 日志级别 (error, warn, info, debug, trace)，优先于 RUST_LOG
    #[arg(long, global = true)]
    log_level: Option<LogLevel>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 由设备 UUID 计算 BLE 地址 (SESAME 5 及之后)
    Btaddr {
        /// 设备 UUID，可指定多个
        #[arg(required = true)]
        uuids: Vec<Uuid>,
    },
    /// 广播数据
    Adv {
        #[command(subcommand)]
        action: AdvCommand,
    },
    /// 解密抓包得到的分片
    Decode {
        /// 32 个十六进制字符的 secret
        #[arg(short, long)]
        secret: String,
        /// 设备下发的 8 个十六进制字符的 nonce
        #[arg(short, long)]
        nonce: String,
        /// 以 peripheral 身份开始 (解密 central 发出的报文)
        #[arg(short, long)]
        peripheral: bool,
        /// 十六进制分片；单独的 C / P 切换角色
        #[arg(required = true)]
        fragments: Vec<String>,
    },
    /// 生成模拟设备使用的 P-256 密钥对
    Keygen {
        /// 私钥写入配置文件的 [server] 段
        #[arg(long)]
        save: bool,
    },
    /// 在内存中运行客户端与模拟设备的完整会话
    Simulate {
        /// 设备型号 (OS3)
        #[arg(short, long, default_value = "sesame_5")]
        model: Model,
        /// 命令附带的标签
        #[arg(short, long, default_value = "sesame-cli")]
        tag: String,
    },
    /// 配置文件
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum AdvCommand {
    /// 解析厂商数据 (OS2 设备还需要设备名)
    Parse {
        /// 厂商数据，十六进制，以 5a05 开头
        #[arg(short, long)]
        manufacturer: String,
        /// 广播中的设备名
        #[arg(short, long, default_value = "")]
        name: String,
    },
    /// 构造 OS3 设备的广播数据
    Build {
        #[arg(short, long, default_value = "sesame_5")]
        model: Model,
        #[arg(short, long)]
        uuid: Uuid,
        /// 标记为已注册
        #[arg(short, long)]
        registered: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// 打印配置文件路径
    Path,
    /// 打印当前生效的配置
    Show,
    /// 写入默认配置
    Init {
        /// 覆盖已有文件
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    tracing::debug!("sesame {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Btaddr { uuids } => {
            for uuid in &uuids {
                let addr = uuid_to_ble_address(uuid)?;
                println!("{uuid} -> {}", format_ble_address(&addr));
            }
        }
        Commands::Adv { action } => run_adv(action)?,
        Commands::Decode {
            secret,
            nonce,
            peripheral,
            fragments,
        } => decode::run(&secret, &nonce, peripheral, &fragments)?,
        Commands::Keygen { save } => keygen(save)?,
        Commands::Simulate { model, tag } => simulate::run(model, &tag)?,
        Commands::Config { action } => run_config(action)?,
    }

    Ok(())
}

/// 过滤规则来源: `--log-level`，然后 `RUST_LOG`，然后配置文件，最后是默认值
fn init_logging(flag: Option<LogLevel>) {
    // 桥接 log crate（sesame-core 使用）到 tracing
    let _ = tracing_log::LogTracer::init();

    let filter = match flag {
        Some(level) => EnvFilter::new(level.directive()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            settings_log_level()
                .map(|level| EnvFilter::new(level.directive()))
                .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVE))
        }),
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

/// 配置文件存在且 `log_level` 有效时才使用
fn settings_log_level() -> Option<LogLevel> {
    if !SesameSettings::config_path().exists() {
        return None;
    }
    SesameSettings::load().log_level.parse().ok()
}

fn run_adv(action: AdvCommand) -> Result<()> {
    match action {
        AdvCommand::Parse { manufacturer, name } => {
            let data = hex::decode(manufacturer.trim()).context("manufacturer data is not hex")?;
            let adv = parse_advertisement(&data, &name)?;
            println!("📡 {}", adv.model);
            println!("   UUID: {}", adv.uuid);
            println!("   已注册: {}", adv.is_registered());
            if adv.model.os_version() == sesame_core::OsVersion::Os3 {
                let addr = uuid_to_ble_address(&adv.uuid)?;
                println!("   地址: {}", format_ble_address(&addr));
            }
        }
        AdvCommand::Build {
            model,
            uuid,
            registered,
        } => {
            if model.os_version() != sesame_core::OsVersion::Os3 {
                bail!("{model} does not advertise in the OS3 format");
            }
            let adv = build_advertisement_os3(model, registered, &uuid);
            println!("manufacturer: {}", hex::encode(&adv.manufacturer_data));
            println!("name: {}", adv.local_name);
        }
    }
    Ok(())
}

fn keygen(save: bool) -> Result<()> {
    let mut ctx = CryptoContext::new()?;
    let mut ecc = Ecc::default();
    ecc.generate_keypair(&mut ctx);
    let pk = ecc.export_pk()?;
    let sk = ecc.export_sk()?;
    println!("🔑 public:  {}", hex::encode(pk));
    println!("   private: {}", hex::encode(sk));

    if save {
        let mut settings = SesameSettings::load();
        settings.server.private_key = Some(hex::encode(sk));
        settings.save()?;
        println!("✅ 已保存到 {}", SesameSettings::config_path().display());
    }
    Ok(())
}

fn run_config(action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Path => println!("{}", SesameSettings::config_path().display()),
        ConfigCommand::Show => print!("{}", SesameSettings::load().to_toml()?),
        ConfigCommand::Init { force } => {
            let path = SesameSettings::config_path();
            if path.exists() && !force {
                bail!("{} already exists, use --force to overwrite", path.display());
            }
            SesameSettings::default().save()?;
            println!("✅ 已写入 {}", path.display());
        }
    }
    Ok(())
}
