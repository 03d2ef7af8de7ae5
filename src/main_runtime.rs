use patchops::adapters::{AdapterContext, AdapterRegistry, AlertRuntime};
use patchops::config::{AlertEngineConfig, AppConfig, ConfigStore, LoggingConfig, OrchestratorConfig};
use patchops::coordination::{install_signal_handlers, Orchestrator, ShutdownHandle};
use patchops::error::Result;
use patchops::metrics::{InMemoryMetricStore, RetentionConfig};
use patchops::persistence::{EventLog, StateFile};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const AUDIT_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Wire the engines and adapters, run until a signal arrives, then shut down
pub async fn run(app: AppConfig) -> Result<()> {
    info!("patchops starting (data dir {})", app.data_dir.display());

    let orchestrator_store =
        ConfigStore::<OrchestratorConfig>::load(app.orchestrator_config_path()).await?;
    let alert_store = ConfigStore::<AlertEngineConfig>::load(app.alert_config_path()).await?;
    let config = orchestrator_store.get().clone();

    let metrics = Arc::new(InMemoryMetricStore::new(RetentionConfig {
        max_age_secs: config.aggregator.retention_secs,
        max_samples_per_metric: config.aggregator.max_samples_per_metric,
    }));
    let (orchestrator_log, orchestrator_writer) = EventLog::spawn(app.orchestrator_log_path());
    let (alert_log, alert_writer) = EventLog::spawn(app.alert_log_path());

    let mut orchestrator = Orchestrator::new(config.clone())
        .with_config_store(orchestrator_store)
        .with_state_file(StateFile::new(app.orchestrator_state_path()))
        .with_event_log(orchestrator_log);

    let alerts = AlertRuntime::new(alert_store.get().clone())
        .with_config_path(app.alert_config_path())
        .with_state_path(app.alert_state_path())
        .with_audit_log(alert_log);

    let ctx = AdapterContext {
        config,
        metrics,
        orchestrator: orchestrator.handle(),
        orchestrator_state: orchestrator.subscribe(),
        alerts,
    };
    orchestrator.install_adapters(AdapterRegistry::from_catalogue(&ctx));
    drop(ctx);

    let shutdown = ShutdownHandle::new();
    install_signal_handlers(shutdown.clone());

    let final_state = orchestrator.run(shutdown.token()).await?;
    info!(
        "patchops stopped: health {} ({}), {} events recorded",
        final_state.system_health.overall,
        final_state.system_health.score,
        final_state.events.len()
    );

    // Writers exit once the last EventLog sender is dropped
    let flushed = tokio::time::timeout(AUDIT_FLUSH_TIMEOUT, async {
        let _ = orchestrator_writer.await;
        let _ = alert_writer.await;
    })
    .await;
    if flushed.is_err() {
        warn!("Audit logs not flushed within {:?}", AUDIT_FLUSH_TIMEOUT);
    }
    Ok(())
}

pub fn init_logging(logging: &LoggingConfig, json: bool) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // Prefer PATCHOPS_LOG_DIR, fall back to LOG_DIR or /var/log/patchops
    let log_dir = std::env::var("PATCHOPS_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "/var/log/patchops".to_string());

    // `rolling::daily` panics if it cannot create the first file, so probe writability first
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".patchops_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "patchops.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Keep the guard for the life of the process
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let (console_text, console_json) = if json || logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_text)
        .with(console_json)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/patchops.log", log_dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for CLI commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
