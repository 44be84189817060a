use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use tubes_core::{LogConfig, LogFormat, Supervisor, ToggleableService, TubesConfig};

/// Tubes - SSH tunnels, SOCKS5 and HTTP proxies over persistent connections
#[derive(Parser, Debug)]
#[command(name = "tubes")]
#[command(about = "Multiplex local tunnels and proxies over SSH connections")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to configuration file (defaults to <config dir>/tubes.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every configured endpoint until interrupted (default)
    Run,

    /// Validate the configuration and print what would be started
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(TubesConfig::default_path);

    let config = TubesConfig::load(&path)
        .with_context(|| format!("Failed to load config from {}", path.display()))?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Check => check(&config),
        Commands::Run => {
            init_logging(&config.log)?;
            tracing::info!("Loaded config from {}", path.display());
            run(path, config).await
        }
    }
}

fn init_logging(log: &LogConfig) -> Result<()> {
    build_subscriber(log, std::io::stdout)?.try_init()?;
    Ok(())
}

type BoxSubscriber = Box<dyn tracing::Subscriber + Send + Sync>;

fn build_subscriber<W>(log: &LogConfig, writer: W) -> Result<BoxSubscriber>
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let filter = match std::env::var("RUST_LOG") {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new("warn")
            .add_directive(format!("tubes={}", log.level).parse()?)
            .add_directive(format!("tubes_core={}", log.level).parse()?),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    Ok(match log.format {
        LogFormat::Json => Box::new(builder.json().finish()),
        LogFormat::Text => Box::new(builder.finish()),
    })
}

fn check(config: &TubesConfig) -> Result<()> {
    let specs = config.finalize().context("Invalid configuration")?;
    if specs.is_empty() {
        println!("No [[ssh]] endpoints configured");
    }
    for spec in &specs {
        println!(
            "{} ({}@{}:{}, auth: {:?})",
            spec.name, spec.user, spec.hostname, spec.port, spec.auth
        );
        for tunnel in &spec.tunnels {
            let state = if tunnel.disabled { "disabled" } else { "enabled" };
            println!(
                "  tunnel {}: {} -> {} [{}]",
                tunnel.name,
                tunnel.local(),
                tunnel.remote(),
                state
            );
        }
        for socks in &spec.socks5 {
            let state = if socks.disabled { "disabled" } else { "enabled" };
            let bridge = socks
                .http_bridge
                .as_deref()
                .map(|b| format!(", http bridge {}", b))
                .unwrap_or_default();
            println!(
                "  socks5 {}: {}{} [{}]",
                socks.name,
                socks.local(),
                bridge,
                state
            );
        }
    }
    Ok(())
}

async fn run(path: PathBuf, config: TubesConfig) -> Result<()> {
    let mut supervisor = Supervisor::new(&config).context("Invalid configuration")?;
    if supervisor.endpoints().is_empty() {
        tracing::warn!("No [[ssh]] endpoints configured in {}", path.display());
    }
    supervisor.activate().await;
    log_listeners(&supervisor);

    loop {
        tokio::select! {
            _ = shutdown_signal() => {
                tracing::info!("Shutdown signal received, closing endpoints...");
                break;
            }
            _ = reload_signal() => {
                tracing::info!("Reloading configuration from {}", path.display());
                let reloaded = TubesConfig::load(&path);
                match reloaded {
                    Ok(config) => match supervisor.restart(&config).await {
                        Ok(_) => log_listeners(&supervisor),
                        Err(e) => tracing::error!("Reload rejected, keeping current endpoints: {}", e),
                    },
                    Err(e) => tracing::error!("Reload failed, keeping current endpoints: {}", e),
                }
            }
        }
    }

    supervisor.shutdown().await;
    tracing::info!("Shutdown complete");
    Ok(())
}

fn log_listeners(supervisor: &Supervisor) {
    for endpoint in supervisor.endpoints() {
        for service in endpoint.services() {
            match service.local_addr() {
                Some(addr) => tracing::info!(
                    endpoint = %endpoint.name(),
                    service = %service.name(),
                    local = %addr,
                    "Service ready"
                ),
                None => tracing::info!(
                    endpoint = %endpoint.name(),
                    service = %service.name(),
                    enabled = service.is_enabled(),
                    "Service not listening"
                ),
            }
        }
    }
}

/// Wait for SIGHUP (unix); never resolves elsewhere
async fn reload_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::hangup()) {
            Ok(mut hangup) => {
                hangup.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGHUP handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    }

    #[cfg(not(unix))]
    std::future::pending::<()>().await;
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Captured {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn emit_with(log: &LogConfig, captured: &Captured) {
        let writer = captured.clone();
        let subscriber = build_subscriber(log, move || writer.clone()).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("Loaded config from {}", "/etc/tubes.toml");
            tracing::debug!("Not shown at info");
        });
    }

    #[test]
    fn test_startup_lines_reach_the_configured_subscriber() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let captured = Captured::default();
        emit_with(&LogConfig::default(), &captured);
        let text = captured.text();
        assert!(text.contains("Loaded config from /etc/tubes.toml"), "got {:?}", text);
        assert!(!text.contains("Not shown"));
    }

    #[test]
    fn test_json_format_writes_json_lines() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let captured = Captured::default();
        let log = LogConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
        };
        emit_with(&log, &captured);
        let text = captured.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2, "got {:?}", text);
        assert!(lines.iter().all(|l| l.starts_with('{')));
        assert!(lines[0].contains("Loaded config from /etc/tubes.toml"));
    }
}
