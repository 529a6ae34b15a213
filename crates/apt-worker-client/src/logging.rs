//! Tracing setup for hosts that do not install their own subscriber.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

pub const ENV_LOG_LEVEL: &str = "APT_WORKER_LOG";
pub const ENV_LOG_FORMAT: &str = "LOG_FORMAT";

/// Filter directives for a base level: the client and forwarded worker output.
fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("apt_worker_client={level},apt_worker={level}")
}

/// Initialize tracing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `APT_WORKER_LOG` picks the level.
/// `LOG_FORMAT=json` switches to JSON lines. Does nothing if a global
/// subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = std::env::var(ENV_LOG_LEVEL).ok();
        EnvFilter::new(default_directives(level.as_deref()))
    };

    let use_json = std::env::var(ENV_LOG_FORMAT).as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}
