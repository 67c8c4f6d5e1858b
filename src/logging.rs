//! # Tracing Module
//!
//! Environment-aware console logging using the tracing ecosystem. Logs go to
//! stderr so that command output on stdout (message ids, route tables) stays
//! machine-readable.
//!
//! - `RUST_LOG` wins when set; otherwise the level follows the environment
//!   (`TASKER_LANES_ENV`, then `APP_ENV`, default `development`)
//! - `LOG_FORMAT=json` switches to one JSON object per line
//! - ANSI colors only when stderr is a terminal

use std::io::IsTerminal;
use std::sync::OnceLock;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::constants::env;

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize the global subscriber once per process
///
/// Safe to call repeatedly and from tests; if another subscriber is already
/// installed it is left in place.
pub fn init_tracing() {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let filter = std::env::var("RUST_LOG")
            .ok()
            .filter(|directives| !directives.is_empty())
            .unwrap_or_else(|| get_log_level(&environment).to_string());
        let json = use_json_format();
        let use_ansi = !json && IsTerminal::is_terminal(&std::io::stderr());

        let console_layer = if json {
            fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        } else {
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(EnvFilter::new(&filter))
                .boxed()
        };

        if tracing_subscriber::registry()
            .with(console_layer)
            .try_init()
            .is_err()
        {
            tracing::debug!("Global tracing subscriber already initialized - continuing with existing subscriber");
        } else {
            tracing::debug!(
                environment = %environment,
                filter = %filter,
                json,
                ansi_colors = use_ansi,
                pid = std::process::id(),
                "Console logging initialized"
            );
        }
    });
}

fn get_environment() -> String {
    std::env::var(env::ENVIRONMENT)
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

fn use_json_format() -> bool {
    std::env::var(env::LOG_FORMAT)
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
