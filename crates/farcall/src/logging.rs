//! Subscriber setup for binaries embedding farcall.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins when set; otherwise `FARCALL_LOG` picks the level for this
/// crate (`debug`, `warn`, `error`, default `info`). `LOG_FORMAT=json` switches
/// to JSON lines. Stdout is left alone: a worker on stdio uses it for frames.
///
/// Calling this more than once is a no-op.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(format!("farcall={}", level_from(std::env::var("FARCALL_LOG").ok().as_deref())))
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

fn level_from(setting: Option<&str>) -> &'static str {
    match setting {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
