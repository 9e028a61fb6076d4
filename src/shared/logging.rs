use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Installs the global subscriber: console on stderr, plus a daily-rotated
/// file under `log_dir` when one is given. `RUST_LOG` overrides the `info`
/// default.
///
/// The returned guards flush buffered lines on drop; hold them until exit.
pub fn init_logging(
    log_dir: Option<&Path>,
    service_name: &str,
) -> Result<Vec<WorkerGuard>, anyhow::Error> {
    let mut guards = Vec::new();

    let (console_writer, console_guard) = non_blocking(std::io::stderr());
    guards.push(console_guard);
    let console_layer = fmt::layer()
        .with_writer(console_writer)
        .with_ansi(true)
        .with_target(false)
        .boxed();

    let file_layer = match log_dir {
        Some(dir) => {
            let _ = rotate_logs_on_startup(dir, service_name);
            std::fs::create_dir_all(dir)?;

            let appender = rolling::daily(dir, format!("{service_name}.log"));
            let (file_writer, file_guard) = non_blocking(appender);
            guards.push(file_guard);
            Some(
                fmt::layer()
                    .with_writer(file_writer)
                    .with_ansi(false)
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .boxed(),
            )
        }
        None => None,
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    if let Some(dir) = log_dir {
        info!("Logging to {}/{service_name}.log", dir.display());
    }

    Ok(guards)
}

/// Moves an existing `<service_name>.log` aside with a timestamp suffix.
pub fn rotate_logs_on_startup(log_dir: &Path, service_name: &str) -> Result<(), anyhow::Error> {
    let log_path = log_dir.join(format!("{service_name}.log"));

    if log_path.exists() {
        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let backup = log_dir.join(format!("{service_name}.{timestamp}.log"));
        std::fs::rename(&log_path, &backup)?;
    }

    Ok(())
}
