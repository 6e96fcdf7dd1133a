use std::{path::PathBuf, process::ExitCode, time::Duration};

use anyhow::{anyhow, Context, Result};
use autotls::{
    config::{Config, TriggerStrategy},
    orchestrator,
};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// 為本機主機名稱取得並快取 TLS 憑證
#[derive(Parser, Debug)]
#[command(name = "autotls")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// 憑證快取目錄
    #[arg(short = 'd', long = "dir", default_value = Config::DEFAULT_CACHE_DIR)]
    dir: PathBuf,

    /// 申請憑證的主機名稱（預設為本機 hostname）
    #[arg(short = 'H', long = "host")]
    host: Option<String>,

    /// TLS 觸發埠，0 代表由系統指定
    #[arg(short = 'p', long = "port", default_value_t = Config::DEFAULT_TRIGGER_PORT)]
    port: u16,

    /// HTTP-01 挑戰監聽埠
    #[arg(long = "http-port", default_value_t = Config::DEFAULT_HTTP_PORT)]
    http_port: u16,

    /// 自我觸發的連線方式：direct 或 resolve
    #[arg(long = "trigger", default_value = "direct")]
    trigger: TriggerStrategy,

    /// 自我觸發的逾時秒數
    #[arg(long = "trigger-timeout", default_value_t = Config::DEFAULT_TRIGGER_TIMEOUT.as_secs())]
    trigger_timeout: u64,

    /// ACME 目錄 URL
    #[arg(
        long = "directory-url",
        env = "AUTOTLS_DIRECTORY_URL",
        default_value = Config::LETS_ENCRYPT_DIRECTORY
    )]
    directory_url: String,

    /// ACME 帳戶聯絡信箱
    #[arg(long = "email", env = "AUTOTLS_EMAIL")]
    email: Option<String>,

    /// 輸出除錯等級的日誌
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(cli: Cli) -> Result<()> {
    let host = match cli.host {
        Some(host) => host,
        None => default_host()?,
    };

    let config = Config::builder(host)
        .cache_dir(cli.dir)
        .trigger_port(cli.port)
        .http_port(cli.http_port)
        .trigger(cli.trigger)
        .trigger_timeout(Duration::from_secs(cli.trigger_timeout))
        .directory_url(cli.directory_url)
        .contact(cli.email)
        .build()
        .context("invalid configuration")?;

    info!(
        host = %config.host,
        cache_dir = %config.cache_dir.display(),
        trigger_port = config.trigger_port,
        http_port = config.http_port,
        "starting autotls"
    );

    let outcome = orchestrator::run(config)
        .await
        .context("failed to obtain certificate")?;
    info!(
        host = %outcome.report.server_name,
        addr = %outcome.trigger_addr,
        "certificate is cached"
    );
    Ok(())
}

fn default_host() -> Result<String> {
    hostname::get()
        .context("failed to read the machine hostname")?
        .into_string()
        .map_err(|_| anyhow!("machine hostname is not valid UTF-8"))
}
