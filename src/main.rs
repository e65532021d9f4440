use anyhow::Context;
use clap::Parser;
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::sync::Mutex;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod backend;
mod cli;
mod commands;
mod config;
mod error;
mod host;

use backend::factory::BackendFactory;
use cli::Cli;
use config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(backend) = &cli.backend {
        config.backend = backend.clone();
    }

    init_logging(&cli, &config)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        origin = ?cli.origin,
        parent_window = ?cli.parent_window,
        backend = %config.backend,
        "nativefm-host starting"
    );

    let backend = BackendFactory::create(&config).context("Failed to create backend")?;

    if cli.check {
        if commands::check_backend(backend).await? {
            return Ok(());
        }
        std::process::exit(1);
    }

    commands::run_host(backend, &config).await?;

    // stdin 종료 = 브라우저 쪽 연결 끊김
    std::process::exit(1);
}

/// 로그는 항상 stderr 또는 파일로 (stdout은 프로토콜 채널)
///
/// 필터 우선순위: --debug > RUST_LOG > 설정 파일 log_filter
fn init_logging(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let filter = if cli.debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let subscriber = builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .finish();
            tracing::subscriber::set_global_default(subscriber).ok();
        }
        None => {
            let subscriber = builder
                .with_ansi(std::io::stderr().is_terminal())
                .with_writer(std::io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber).ok();
        }
    }

    Ok(())
}
