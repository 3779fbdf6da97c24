//! Process-scoped logging state
//!
//! The log level and SQL-echo toggle live in the settings row but apply to
//! the whole process. Writers go through the mutators here, which reload the
//! global tracing filter so changes take effect without a restart.

use once_cell::sync::OnceCell;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{reload, EnvFilter, Registry};

static FILTER_HANDLE: OnceCell<reload::Handle<EnvFilter, Registry>> = OnceCell::new();
static SQL_LOGGING: AtomicBool = AtomicBool::new(false);

/// Install the reload handle produced at subscriber construction.
/// Later installs are ignored (first writer wins).
pub fn set_reload_handle(handle: reload::Handle<EnvFilter, Registry>) {
    let _ = FILTER_HANDLE.set(handle);
}

/// Reload the global filter to the given level (e.g. "INFO", "DEBUG").
pub fn set_log_level(level: &str) {
    let directive = format!("strmgen={},tower_http=warn", level.trim().to_lowercase());
    if let Some(handle) = FILTER_HANDLE.get() {
        match directive.parse::<EnvFilter>() {
            Ok(filter) => {
                if let Err(e) = handle.reload(filter) {
                    tracing::warn!("Failed to reload log filter: {}", e);
                }
            }
            Err(e) => tracing::warn!("Invalid log level '{}': {}", level, e),
        }
    }
}

pub fn set_sql_logging_enabled(enabled: bool) {
    SQL_LOGGING.store(enabled, Ordering::Relaxed);
}

/// Whether the store should echo statements at debug level
pub fn sql_logging_enabled() -> bool {
    SQL_LOGGING.load(Ordering::Relaxed)
}

/// Apply the logging-related fields of a settings value
pub fn apply_settings(settings: &crate::settings::Settings) {
    set_sql_logging_enabled(settings.enable_sql_logging);
    set_log_level(&settings.log_level);
}
