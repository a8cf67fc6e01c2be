//! Subscriber setup shared by the bundled binaries.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Environment variable selecting the base level when `RUST_LOG` is unset.
pub const ENV_LOG: &str = "BIFROST_LOG";

/// Install a stderr subscriber. `RUST_LOG` wins; otherwise `BIFROST_LOG` picks
/// the level for this crate and companion output. `LOG_FORMAT=json` switches
/// to JSON lines.
///
/// Stdout is never written to: the companion side uses it as its channel.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(default_directives(std::env::var(ENV_LOG).ok().as_deref()))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

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

fn default_directives(level: Option<&str>) -> String {
    let level = match level {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    };
    format!("bifrost={level},bifrost_cli={level},stub_companion={level}")
}
