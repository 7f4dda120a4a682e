// Local crates
use crate::{
    broker::{
        callbacks::Callbacks,
        dispatcher::Dispatcher,
        error::BrokerError,
        session::{EventRouter, Session},
    },
    helpers::{load_config::Settings, shutdown::Shutdown, signals::listen_for_signals},
    logger::logger::{LogSink, Logger, Severity},
    metrics::http::start_metrics_server,
    pool::worker_pool::WorkerPool,
};

// External crates
use anyhow::{Context, Result};
use rumqttc::AsyncClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// mqtt-logger runtime: open the system log, install the signal handlers and
/// run until SIGINT/SIGTERM. Returns an error only when startup fails.
pub async fn run_mqtt_logger(settings: Settings) -> Result<()> {
    let sink: Arc<dyn LogSink> = Arc::new(Logger::open(
        &settings.ident,
        settings.facility,
        settings.log_to_stderr,
    ));

    // Signals only flip the stop flag; everything below observes it.
    let shutdown = Shutdown::new();
    let _signals =
        listen_for_signals(shutdown.clone()).context("Failed to install signal handlers")?;

    run_with(settings, sink, shutdown).await
}

/// Connect, log to `sink` until `shutdown` is triggered, then tear down in
/// order: MQTT disconnect, worker pool, final log line.
#[instrument(name = "mqtt_logger::runtime", target = "runtime", level = "debug", skip_all)]
pub async fn run_with(settings: Settings, sink: Arc<dyn LogSink>, shutdown: Shutdown) -> Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    sink.log(
        Severity::Info,
        &format!("Started mqtt-logger {version} (broker {})", settings.session.address),
    );

    let pool = Arc::new(
        WorkerPool::with_limits(settings.workers, settings.queue)
            .context("Failed to start worker pool")?,
    );
    info!(workers = pool.worker_count(), "Worker pool started");

    let metrics_task = settings.metrics_addr.map(|addr| {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(addr, shutdown).await {
                warn!(error = %e, %addr, "Metrics server stopped");
            }
        })
    });

    let mut session = Session::new(settings.session.clone());
    let dispatcher = Dispatcher::new(Arc::clone(&pool), Arc::clone(&sink));
    let callbacks = Callbacks::new(
        Arc::new(session.subscriber()),
        settings.topic.clone(),
        settings.qos,
        Arc::clone(&sink),
        dispatcher,
    );
    let mut router = EventRouter::new(callbacks, session.ledger());

    sink.log(
        Severity::Info,
        &format!("Connecting to MQTT broker {}", settings.session.address),
    );
    let connected = tokio::select! {
        result = session.connect(&mut router) => Some(result),
        _ = shutdown.wait() => None,
    };

    match connected {
        Some(Ok(())) => {}
        Some(Err(e)) => {
            let line = match &e {
                BrokerError::ConnectTimeout(_) => "Timeout Connecting".to_string(),
                other => format!("Error Connecting: {other}"),
            };
            sink.log(Severity::Error, &line);
            drop(router);
            stop_pool(pool).await;
            shutdown.trigger();
            return Err(e).context("Initial connect to the MQTT broker failed");
        }
        None => {
            info!("Stop requested before the broker connection was established");
            drop(router);
            stop_pool(pool).await;
            sink.log(Severity::Info, &format!("Stopping mqtt-logger {version}"));
            return Ok(());
        }
    }

    let client = session.client();
    let disconnect_timeout = settings.session.disconnect_timeout;
    let cancel = CancellationToken::new();
    let session_task = tokio::spawn(session.run(router, cancel.child_token()));

    shutdown.wait().await;
    info!("Stop requested, shutting down");

    disconnect(client, session_task, cancel, &pool, disconnect_timeout).await;
    stop_pool(pool).await;

    if let Some(task) = metrics_task {
        // The server observes the same stop flag.
        let _ = task.await;
    }

    sink.log(Severity::Info, &format!("Stopping mqtt-logger {version}"));
    Ok(())
}

/// Send the MQTT disconnect and wait for the session task to finish. After
/// `timeout` the session is cancelled instead.
///
/// The session task may be parked in a blocking `enqueue` that cancellation
/// cannot reach, so the pool is closed before waiting on it again.
#[instrument(name = "mqtt_logger::disconnect", target = "runtime", level = "debug", skip_all)]
async fn disconnect(
    client: AsyncClient,
    mut session_task: JoinHandle<()>,
    cancel: CancellationToken,
    pool: &WorkerPool,
    timeout: Duration,
) {
    let graceful = tokio::time::timeout(timeout, async {
        if let Err(e) = client.disconnect().await {
            // The event loop is already gone, nothing to flush.
            warn!(error = %e, "MQTT disconnect request not delivered");
        }
        (&mut session_task).await
    })
    .await;

    match graceful {
        Ok(Ok(())) => info!("MQTT session closed"),
        Ok(Err(e)) => warn!(error = %e, "MQTT session task failed"),
        Err(_) => {
            warn!(?timeout, "MQTT disconnect timed out, cancelling session");
            pool.close();
            cancel.cancel();
            if let Err(e) = session_task.await {
                warn!(error = %e, "MQTT session task failed");
            }
        }
    }
}

/// Stop the worker pool off the async runtime; joining executors blocks.
async fn stop_pool(pool: Arc<WorkerPool>) {
    match tokio::task::spawn_blocking(move || pool.shutdown()).await {
        Ok(0) => info!("Worker pool stopped"),
        Ok(discarded) => info!(discarded, "Worker pool stopped, queued messages discarded"),
        Err(e) => warn!(error = %e, "Worker pool shutdown did not complete"),
    }
}
