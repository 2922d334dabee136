use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pki_authority::api;
use pki_authority::authority::CertificateAuthority;
use pki_authority::config::AuthorityConfig;

#[derive(Parser)]
#[command(name = "pki-authority")]
#[command(about = "Certificate authority REST server")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overrides `server.bind`
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AuthorityConfig::from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => AuthorityConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!(
        key_algorithm = ?config.key_algorithm,
        crl_validity_days = config.crl_validity_days,
        max_validity_days = ?config.max_validity_days,
        data_dir = ?config.storage.data_dir,
        "starting certificate authority"
    );
    let passphrase = std::env::var(&config.storage.passphrase_env).ok();
    let authority = CertificateAuthority::open(&config, passphrase.as_deref())
        .context("opening certificate authority")?;
    let authority = Arc::new(authority);
    api::serve(authority, config.server.bind).await;
    Ok(())
}
