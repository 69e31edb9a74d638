use scanrelay_core::models::ScannerKind;
use typed_path::Utf8NativePathBuf;

// For argp::FromArgs
pub fn native_path(value: &str) -> Result<Utf8NativePathBuf, String> {
    Ok(Utf8NativePathBuf::from(value))
}

// For argp::FromArgs
pub fn scanner_kind(value: &str) -> Result<ScannerKind, String> {
    value.parse().map_err(|_| {
        let known = ScannerKind::variants().iter().map(|k| k.as_str()).collect::<Vec<_>>();
        format!("unknown scanner '{}' (expected one of: {})", value, known.join(", "))
    })
}

/// Resolves on ctrl-c or SIGTERM.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        }
        _ = terminate => {}
    }
    tracing::info!("Shutdown signal received");
}
