use std::env;

use metricator_service::config::{Config, LogFormat};
use sentry::integrations::tracing::EventFilter;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::prelude::*;

fn get_rust_log(level: LevelFilter) -> &'static str {
    match level {
        LevelFilter::OFF => "",
        LevelFilter::ERROR => "ERROR",
        LevelFilter::WARN => "WARN",
        LevelFilter::INFO => {
            "INFO,\
             hyper=WARN,\
             reqwest=WARN"
        }
        LevelFilter::DEBUG => {
            "INFO,\
             metricator=DEBUG,\
             metricator_service=DEBUG"
        }
        LevelFilter::TRACE => {
            "INFO,\
             metricator=TRACE,\
             metricator_service=TRACE"
        }
    }
}

/// Initializes logging for metricator.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level. Additionally,
/// this toggles `RUST_BACKTRACE` based on the `enable_backtraces` config value.
///
/// # Safety
/// This function uses [`std::env::set_var`] to modify the environment. That function is only safe
/// to call in single-threaded contexts to prevent unsynchronized concurrent access to the environment.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, this function may only be called in a single-threaded context.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let rust_log =
        env::var("RUST_LOG").unwrap_or_else(|_| get_rust_log(config.logging.level).to_string());

    let fmt_layer = {
        let layer = tracing_subscriber::fmt::layer()
            .with_timer(UtcTime::rfc_3339())
            .with_target(true);

        match (config.logging.format, console::user_attended()) {
            (LogFormat::Auto, true) | (LogFormat::Pretty, _) => layer.pretty().boxed(),
            (LogFormat::Auto, false) | (LogFormat::Simplified, _) => {
                layer.compact().with_ansi(false).boxed()
            }
            // span fields are flattened into every event, so a fetch job's `key` and `trigger`
            // show up on all of its log lines
            (LogFormat::Json, _) => layer
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(true)
                .boxed(),
        }
    }
    .with_filter(EnvFilter::new(&rust_log));

    // Errors become events, warnings and infos are kept as breadcrumbs for them.
    let sentry_layer =
        sentry::integrations::tracing::layer().event_filter(|md| match *md.level() {
            tracing::Level::ERROR => EventFilter::Event,
            tracing::Level::WARN | tracing::Level::INFO => EventFilter::Breadcrumb,
            tracing::Level::DEBUG | tracing::Level::TRACE => EventFilter::Ignore,
        });

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sentry_layer)
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if tracing::Level::ERROR <= tracing::level_filters::STATIC_MAX_LEVEL
        && tracing::Level::ERROR <= LevelFilter::current()
    {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
