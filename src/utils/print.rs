//! Logging initialization and printing macros.

use std::sync::OnceLock;

/// Identity of myself printed in log lines ("s1".."s3" for replicas, "c"
/// for clients). Set once at logger initialization.
static ME: OnceLock<String> = OnceLock::new();

/// Returns my identity string for log prefixes.
pub fn me() -> &'static str {
    ME.get().map(String::as_str).unwrap_or("?")
}

/// Initializes the env_logger backend and records my identity. Safe to
/// call more than once (later calls are no-ops).
pub fn logger_init(whoami: impl ToString) {
    let _ = ME.set(whoami.to_string());
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp_millis()
    .try_init();
}

/// Log TRACE message with my identity attached.
#[macro_export]
macro_rules! pf_trace {
    ($($fmt_args:tt)*) => {
        log::trace!("({}) {}", $crate::me(), format!($($fmt_args)*))
    };
}

/// Log DEBUG message with my identity attached.
#[macro_export]
macro_rules! pf_debug {
    ($($fmt_args:tt)*) => {
        log::debug!("({}) {}", $crate::me(), format!($($fmt_args)*))
    };
}

/// Log INFO message with my identity attached.
#[macro_export]
macro_rules! pf_info {
    ($($fmt_args:tt)*) => {
        log::info!("({}) {}", $crate::me(), format!($($fmt_args)*))
    };
}

/// Log WARN message with my identity attached.
#[macro_export]
macro_rules! pf_warn {
    ($($fmt_args:tt)*) => {
        log::warn!("({}) {}", $crate::me(), format!($($fmt_args)*))
    };
}

/// Log ERROR message with my identity attached.
#[macro_export]
macro_rules! pf_error {
    ($($fmt_args:tt)*) => {
        log::error!("({}) {}", $crate::me(), format!($($fmt_args)*))
    };
}

/// Log an error message, then return a `SubastaError` containing it.
#[macro_export]
macro_rules! logged_err {
    ($($fmt_args:tt)*) => {{
        $crate::pf_error!($($fmt_args)*);
        Err($crate::SubastaError::msg(format!($($fmt_args)*)))
    }};
}
