//! Structured logging for weeki.
//!
//! Log levels:
//! - ERROR: Task loops aborted by contract violations
//! - WARN: Sub-task failures, timeouts, cancellations
//! - INFO: Task lifecycle (accepted, decomposed, finished), startup, shutdown
//! - DEBUG: Scheduling passes, slot admission and release
//! - TRACE: Readiness recomputation and snapshot publication
//!
//! Debug mode can be enabled with `--debug` flag or `WEEKI_DEBUG=1` env var.
//! `WEEKI_LOG` takes a full `EnvFilter` directive and wins over both.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Environment variable holding a full filter directive.
pub const FILTER_ENV: &str = "WEEKI_LOG";

/// Environment variable that switches on debug output.
pub const DEBUG_ENV: &str = "WEEKI_DEBUG";

/// Initialize logging at the default level.
pub fn init() {
    init_with_debug(false);
}

/// Initialize logging with explicit debug mode setting.
pub fn init_with_debug(debug: bool) {
    init_with_level(debug, "info");
}

/// Initialize logging with debug mode and the configured crate level.
///
/// Safe to call more than once; only the first call installs a subscriber.
pub fn init_with_level(debug: bool, level: &str) {
    let env_debug = parse_debug_flag(std::env::var(DEBUG_ENV).ok().as_deref());
    let debug_enabled = debug || env_debug;
    DEBUG_ENABLED.store(debug_enabled, Ordering::SeqCst);

    let filter = EnvFilter::try_from_env(FILTER_ENV)
        .unwrap_or_else(|_| EnvFilter::new(directive_for(debug_enabled, level)));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Check if debug mode is enabled.
pub fn is_debug() -> bool {
    DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Filter directive used when `WEEKI_LOG` is not set.
pub fn default_directive(debug: bool) -> &'static str {
    if debug {
        "weeki=debug,info"
    } else {
        "weeki=info,warn"
    }
}

fn directive_for(debug: bool, level: &str) -> String {
    if debug || level.is_empty() || level == "info" {
        default_directive(debug).to_string()
    } else {
        format!("weeki={},warn", level)
    }
}

fn parse_debug_flag(value: Option<&str>) -> bool {
    value
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
