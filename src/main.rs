use clap::Parser;
use tracing::{error, info};
use tracing_appender::non_blocking;
use warden::{config::Config, server::ProxyServer};

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "Credential-injecting database proxy")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "demos/warden.yaml")]
    config: String,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // RUST_LOG names a single level; anything else means info.
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn run_with_config_path_and_shutdown(
    config_path: &str,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_yaml_file(config_path).await?;
    let server = ProxyServer::from_config(&config)?;

    let bound = match server.start().await {
        Ok(bound) => bound,
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    };
    for (name, addr) in &bound {
        info!("Service '{}' ready on {}", name, addr);
    }

    shutdown.await;
    info!("Shutdown signal received");
    server.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting Warden - credential-injecting database proxy");
    run_with_config_path_and_shutdown(&args.config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!("Warden stopped");
    Ok(())
}
