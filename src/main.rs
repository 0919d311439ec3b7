use anyhow::Result;
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use volteria_controller::state::SharedState;
use volteria_controller::supervisor::Supervisor;

fn init_tracing() {
    let filter = EnvFilter::try_from_env("VOLTERIA_LOG_LEVEL")
        .unwrap_or_else(|_| EnvFilter::new("volteria_controller=info"));

    let json = std::env::var("VOLTERIA_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    println!("─────────────────────────────────────────────────────");
    println!(" Volteria Hybrid-Site Controller | v{}", env!("CARGO_PKG_VERSION"));
    println!("─────────────────────────────────────────────────────");
    println!(" Health:  system  http://127.0.0.1:8081/health");
    println!("          config  http://127.0.0.1:8082/health");
    println!("          device  http://127.0.0.1:8083/health");
    println!("          control http://127.0.0.1:8084/health");
    println!("          logging http://127.0.0.1:8085/health");
    println!("─────────────────────────────────────────────────────");

    let state = SharedState::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let supervisor = Supervisor::new(state);
    let run = tokio::spawn(supervisor.run(shutdown_rx));

    // Graceful shutdown on SIGINT/SIGTERM: the supervisor stops the
    // fleet in reverse order.
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("SIGINT received, shutting down");
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => { sigterm.recv().await; }
                    Err(_) => std::future::pending::<()>().await,
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            info!("SIGTERM received, shutting down");
        }
    }

    let _ = shutdown_tx.send(true);
    let _ = run.await;

    info!("controller stopped");
    Ok(())
}
