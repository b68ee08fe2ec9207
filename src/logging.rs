//! Tracing setup and boot instrumentation.
//!
//! The subscriber is installed once by the binary; everything else logs
//! through `tracing` macros. Boot progress goes through [`BootLog`],
//! which owns the phase numbering and times the whole sequence.

use std::fmt::Display;
use std::time::Instant;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level when set. The JSON layer
/// is for deployments that ship logs to a collector.
pub fn init_tracing(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if config.json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Numbered progress log for the boot sequence.
///
/// Each phase prints as `[n/total] Name - detail`. Keeping the counter
/// here means call sites cannot drift out of order when a phase is
/// added or removed.
#[derive(Debug)]
pub struct BootLog {
    total: usize,
    next: usize,
    started: Instant,
}

impl BootLog {
    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            next: 1,
            started: Instant::now(),
        }
    }

    /// Log the next phase as done.
    pub fn phase(&mut self, name: &str, detail: impl Display) {
        tracing::info!(
            step = self.next,
            total = self.total,
            "[{}/{}] {} - {}",
            self.next,
            self.total,
            name,
            detail
        );
        self.next += 1;
    }

    /// Log a non-fatal boot problem without consuming a phase number.
    pub fn warn(&self, message: impl Display) {
        tracing::warn!("⚠️  {message}");
    }

    /// Close the sequence with the total elapsed time.
    pub fn finish(self) {
        tracing::info!(
            phases = self.total,
            elapsed_ms = self.started.elapsed().as_millis(),
            "boot complete"
        );
    }
}

/// Times one named operation, logging the duration with the outcome.
#[derive(Debug)]
pub struct Timed {
    what: &'static str,
    started: Instant,
}

impl Timed {
    #[must_use]
    pub fn start(what: &'static str) -> Self {
        tracing::debug!(operation = what, "started");
        Self {
            what,
            started: Instant::now(),
        }
    }

    /// Record completion, carrying the error when there was one.
    pub fn record<T, E: Display>(self, result: &Result<T, E>) {
        let elapsed_ms = self.started.elapsed().as_millis();
        match result {
            Ok(_) => {
                tracing::info!(operation = self.what, elapsed_ms, "completed");
            }
            Err(err) => {
                tracing::error!(operation = self.what, elapsed_ms, error = %err, "failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_phases_count_up() {
        let mut boot = BootLog::new(3);
        assert_eq!(boot.next, 1);
        boot.phase("Database", "ready");
        boot.phase("Router", format!("{} routes", 9));
        assert_eq!(boot.next, 3);
        boot.finish();
    }

    #[test]
    fn timed_records_success() {
        let timed = Timed::start("store init");
        let result: Result<(), String> = Ok(());
        timed.record(&result);
    }

    #[test]
    fn timed_records_failure() {
        let timed = Timed::start("store init");
        let result: Result<(), String> = Err("disk full".to_string());
        timed.record(&result);
    }
}
