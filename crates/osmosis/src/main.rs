use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use futures::future::BoxFuture;
use osmosis_proxy::{hooks, Event, Hook, Next, ProxyConfig, ProxyResponse, ProxyResult};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Tags every forwarded request with the proxy's User-Agent.
struct SetProxyUserAgent;

impl Hook for SetProxyUserAgent {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            event.request.headers.set("User-Agent", "Osmosis Proxy");
            next.run(event).await
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "osmosis", about = "Intercepting HTTP/HTTPS forward proxy")]
struct Options {
    /// Read the CA certificate from this file.
    #[arg(long = "cert", value_name = "PATH", default_value = "ca.crt")]
    certificate: PathBuf,

    /// Read the CA private key from this file.
    #[arg(long = "key", value_name = "PATH", default_value = "ca.key")]
    key: PathBuf,

    /// Listen address.
    #[arg(long = "listen", value_name = "ADDR", default_value = "[::1]:8080")]
    listen: SocketAddr,

    /// Directory for request logs written by external tooling.
    #[arg(long = "log-dir", value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Disable the graphical user interface.
    #[arg(long = "no-gui")]
    no_gui: bool,
}

fn main() -> ExitCode {
    let options = match Options::try_parse() {
        Ok(options) => options,
        Err(error) => {
            // Flag parse failures exit with code 1.
            let _ = error.print();
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!("fatal: {error}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: Options) -> Result<(), Box<dyn std::error::Error>> {
    let ca = osmosis_certauth::load_or_generate(&options.certificate, &options.key)?;
    tracing::info!("CA loaded from {}", options.certificate.display());

    if let Some(log_dir) = &options.log_dir {
        std::fs::create_dir_all(log_dir)?;
    }
    if options.no_gui {
        tracing::info!("graphical user interface disabled");
    }

    let mut config = ProxyConfig::default();
    config.bind = options.listen;

    let mut proxy = osmosis_proxy::Proxy::new(config, ca)?;
    proxy.register(hooks::LogCompleteRequest);
    proxy.register(SetProxyUserAgent);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async move {
        let handle = proxy.start().await?;
        tracing::info!("listening on {}", handle.local_addr());

        tokio::signal::ctrl_c().await?;
        tracing::info!("interrupt received, shutting down");
        handle.shutdown(SHUTDOWN_GRACE).await?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}
