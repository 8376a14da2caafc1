//! Process signal handling

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// A token cancelled on SIGINT, SIGTERM, SIGHUP or SIGQUIT
pub fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        let name = shutdown_signal().await;
        info!(signal = name, "Shutdown signal received");
        trigger.cancel();
    });
    token
}

#[cfg(unix)]
async fn shutdown_signal() -> &'static str {
    use signal::unix::{signal, SignalKind};

    let mut streams = Vec::new();
    for (kind, name) in [
        (SignalKind::interrupt(), "SIGINT"),
        (SignalKind::terminate(), "SIGTERM"),
        (SignalKind::hangup(), "SIGHUP"),
        (SignalKind::quit(), "SIGQUIT"),
    ] {
        match signal(kind) {
            Ok(stream) => streams.push((stream, name)),
            Err(e) => error!("Failed to install {} handler: {}", name, e),
        }
    }

    if streams.is_empty() {
        return std::future::pending().await;
    }

    let waits = streams.into_iter().map(|(mut stream, name)| {
        Box::pin(async move {
            stream.recv().await;
            name
        })
    });
    futures::future::select_all(waits).await.0
}

#[cfg(not(unix))]
async fn shutdown_signal() -> &'static str {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to install Ctrl+C handler: {}", e);
        return std::future::pending().await;
    }
    "ctrl-c"
}
