use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use tgw_core::{config::Config, ports::UpdateSource, worker::Worker};
use tgw_kafka::{KafkaResponseSink, KafkaUpdateSource};
use tgw_sidecar::HttpSidecar;

/// Exit status follows `main`'s result: `Ok` is 0 (signal), `Err` is 1
/// (config, connect or broker failure).
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tgw_core::logging::init("tgw")?;

    // Nothing is opened until configuration is valid.
    let cfg = Arc::new(Config::load()?);
    for line in cfg.summary() {
        tracing::info!("{line}");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            shutdown_signal().await;
            tracing::info!("Shutting down gracefully...");
            cancel.cancel();
        }
    });

    // Built before any broker connection so its failure leaves nothing to close.
    let sidecar = Arc::new(HttpSidecar::new(&cfg).context("building sidecar client")?);

    let mut source = KafkaUpdateSource::connect(&cfg).context("opening consumer")?;
    let sink = match KafkaResponseSink::connect(&cfg) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = source.close().await;
            return Err(e).context("opening producer");
        }
    };

    let stats = Worker::new(cfg.clone(), source, sink, sidecar)
        .run(cancel)
        .await
        .context("worker stopped on broker error")?;

    tracing::info!(responded = stats.responded, "bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
