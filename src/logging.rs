//! Logging setup.
//!
//! The crate logs through the [`log`] facade. Hosts that do not install their own
//! logger can call [`init_logging`] to get an `env_logger` backend; `RUST_LOG`
//! still overrides the configured level.

use crate::config::LogLevel;

/// Installs `env_logger` at `level`. Calling it twice is harmless.
pub fn init_logging(level: LogLevel) {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(level.into());
    if let Ok(spec) = std::env::var("RUST_LOG") {
        builder.parse_filters(&spec);
    }
    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_does_not_panic() {
        init_logging(LogLevel::Debug);
        init_logging(LogLevel::Info);
        log::info!("logging works");
    }
}
