use anyhow::Result;
use clap::{Parser, Subcommand};
use xshell::{Shell, cmd};

#[derive(Parser)]
#[command(name = "xtask", about = "SESAME 开发任务自动化")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 构建所有组件 (release)
    Build,
    /// 运行测试
    Test {
        /// 只运行 sesame-core 的测试
        #[arg(long)]
        core: bool,
    },
    /// clippy 与格式检查
    Lint,
    /// 运行测试并生成覆盖率报告
    Coverage,
    /// 清理构建产物
    Clean,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let sh = Shell::new()?;

    // 确保在项目根目录执行
    let project_root = match std::env::var("CARGO_MANIFEST_DIR") {
        Ok(dir) => std::path::PathBuf::from(dir)
            .parent()
            .map(std::path::Path::to_path_buf)
            .unwrap_or_default(),
        Err(_) => std::env::current_dir()?,
    };
    sh.change_dir(&project_root);

    match cli.command {
        Commands::Build => build(&sh)?,
        Commands::Test { core } => test(&sh, core)?,
        Commands::Lint => lint(&sh)?,
        Commands::Coverage => coverage(&sh)?,
        Commands::Clean => clean(&sh)?,
    }

    Ok(())
}

fn build(sh: &Shell) -> Result<()> {
    println!("🔨 构建所有组件...");
    cmd!(sh, "cargo build --release -p sesame-core -p sesame-cli").run()?;
    println!("✅ 构建完成: target/release/sesame");
    Ok(())
}

fn test(sh: &Shell, core_only: bool) -> Result<()> {
    println!("🧪 运行测试...");
    if core_only {
        cmd!(sh, "cargo test -p sesame-core").run()?;
    } else {
        cmd!(sh, "cargo test --workspace").run()?;
    }
    println!("✅ 测试完成");
    Ok(())
}

fn lint(sh: &Shell) -> Result<()> {
    println!("🔍 检查代码...");
    cmd!(sh, "cargo fmt --all -- --check").run()?;
    cmd!(sh, "cargo clippy --workspace --all-targets -- -D warnings").run()?;
    println!("✅ 检查通过");
    Ok(())
}

fn coverage(sh: &Shell) -> Result<()> {
    println!("📊 运行测试覆盖率分析...");

    // 检查 cargo-tarpaulin 是否安装
    if cmd!(sh, "cargo tarpaulin --version").run().is_err() {
        println!("📦 安装 cargo-tarpaulin...");
        cmd!(sh, "cargo install cargo-tarpaulin").run()?;
    }

    cmd!(
        sh,
        "cargo tarpaulin --packages sesame-core --out Html --output-dir target/coverage"
    )
    .run()?;

    println!("✅ 覆盖率报告已生成");
    println!("   HTML 报告: target/coverage/tarpaulin-report.html");
    Ok(())
}

fn clean(sh: &Shell) -> Result<()> {
    println!("🧹 清理构建产物...");
    cmd!(sh, "cargo clean").run()?;
    println!("✅ 清理完成");
    Ok(())
}
