use anyhow::Result;
use tokio::signal;

/// Wait until the process is asked to stop (Ctrl+C, or SIGTERM on Unix).
pub async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    let terminate = async {
        let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        term.recv().await;
        Ok::<(), std::io::Error>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<std::io::Result<()>>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(%e, "Failed to listen for Ctrl+C");
                return Err(e.into());
            }
            tracing::info!("Received Ctrl+C signal");
        },
        result = terminate => {
            if let Err(e) = result {
                tracing::error!(%e, "Failed to listen for SIGTERM");
                return Err(e.into());
            }
            tracing::info!("Received SIGTERM signal");
        },
    }

    tracing::info!("Shutdown signal received, initiating graceful shutdown");
    Ok(())
}
