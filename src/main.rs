use anyhow::{Context, Result};
use std::sync::Arc;
use tapwire::mitm::{CertificateAuthority, FileCertificateStore, UpstreamTlsConfig};
use tapwire::{Config, Proxy, ProxyOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_PORT: u16 = 8089;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("{} v{} starting", tapwire::NAME, tapwire::VERSION);

    let mut config = Config::from_env()?;
    if std::env::var_os("PROXY_PORT").is_none() {
        config.port = DEFAULT_PORT;
    }

    let upstream_tls = match &config.upstream_ca_file {
        Some(path) => {
            let pem = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            UpstreamTlsConfig::with_extra_roots_pem(&pem)?
        }
        None => UpstreamTlsConfig::new()?,
    };

    let mut options = ProxyOptions::from_config(&config, upstream_tls);

    if config.intercept_tls {
        let authority = match &config.ca_store_dir {
            Some(dir) => {
                let store = FileCertificateStore::new(dir);
                CertificateAuthority::load_or_initialize(&store).await?
            }
            None => CertificateAuthority::initialize().await?,
        };
        tracing::info!(
            persisted = config.ca_store_dir.is_some(),
            "Certificate Authority ready; install the root below to trust intercepted traffic"
        );
        println!("{}", authority.root_certificate_pem());
        options = options.with_authority(Arc::new(authority));
    }

    let proxy = Proxy::new(options);
    proxy.listen().await?;
    tracing::info!(url = ?proxy.url(), "Listening on {}", proxy.port().unwrap_or(config.port));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    proxy.close().await;
    Ok(())
}
