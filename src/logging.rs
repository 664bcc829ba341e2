//! Log setup for the binary and, with the `python` feature, a bridge that
//! forwards `log` records into Python's `logging` module.

use std::sync::Once;

use env_logger::Env;
use log::LevelFilter;

static RUST_LOG_ONCE: Once = Once::new();

/// Level from `PREX_LOG`, then `RUST_LOG`, defaulting to `info`.
fn env_level() -> LevelFilter {
    std::env::var("PREX_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .ok()
        .as_deref()
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

fn parse_level(input: &str) -> Option<LevelFilter> {
    input.trim().parse::<LevelFilter>().ok()
}

/// Install the stderr logger. Later calls are no-ops.
pub fn init_rust_logging() {
    let level = env_level();
    RUST_LOG_ONCE.call_once(|| {
        let env = Env::default().default_filter_or(level.as_str().to_ascii_lowercase());
        env_logger::Builder::from_env(env)
            .format_timestamp_millis()
            .format_module_path(true)
            .format_target(false)
            .init();
    });
}

#[cfg(feature = "python")]
pub use python::{init_python_logging, set_python_log_level};

#[cfg(feature = "python")]
mod python {
    use std::sync::{Mutex, Once};

    use log::{Level, LevelFilter, Log, Metadata, Record};
    use once_cell::sync::OnceCell;
    use pyo3::prelude::*;
    use pyo3::types::PyModule;

    use super::{env_level, parse_level};

    static PY_LOG_ONCE: Once = Once::new();
    static PY_LOGGER: OnceCell<&'static PyLogger> = OnceCell::new();

    /// Forwards each record to `logging.getLogger(<target>)`, with `::` in the
    /// target turned into `.` so Python's logger hierarchy applies.
    struct PyLogger {
        filter: Mutex<LevelFilter>,
        logging: Py<PyModule>,
    }

    fn python_level(level: Level) -> u8 {
        match level {
            Level::Error => 40,
            Level::Warn => 30,
            Level::Info => 20,
            Level::Debug => 10,
            Level::Trace => 5,
        }
    }

    impl PyLogger {
        fn current_filter(&self) -> LevelFilter {
            self.filter
                .lock()
                .map(|f| *f)
                .unwrap_or(LevelFilter::Info)
        }

        fn forward(&self, py: Python<'_>, record: &Record) -> PyResult<()> {
            let target = record.target().replace("::", ".");
            let logger = self.logging.bind(py).call_method1("getLogger", (target,))?;
            let message = format!("{}", record.args());
            logger.call_method1("log", (python_level(record.level()), message))?;
            Ok(())
        }
    }

    impl Log for PyLogger {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.level().to_level_filter() <= self.current_filter()
        }

        fn log(&self, record: &Record) {
            if !self.enabled(record.metadata()) {
                return;
            }
            Python::attach(|py| {
                if let Err(e) = self.forward(py, record) {
                    e.restore(py);
                }
            });
        }

        fn flush(&self) {}
    }

    /// Route Rust logs into Python's `logging`. Safe to call repeatedly.
    pub fn init_python_logging(py: Python<'_>) -> PyResult<()> {
        let level = env_level();
        let mut result = Ok(());
        PY_LOG_ONCE.call_once(|| match py.import("logging") {
            Ok(logging) => {
                let logger: &'static PyLogger = Box::leak(Box::new(PyLogger {
                    filter: Mutex::new(level),
                    logging: logging.unbind(),
                }));
                if log::set_logger(logger).is_ok() {
                    log::set_max_level(level);
                    let _ = PY_LOGGER.set(logger);
                }
            }
            Err(e) => result = Err(e),
        });
        result
    }

    /// Change the minimum forwarded level; `None` re-reads the environment.
    pub fn set_python_log_level(py: Python<'_>, level: Option<&str>) -> PyResult<()> {
        init_python_logging(py)?;
        let level = level.and_then(parse_level).unwrap_or_else(env_level);
        if let Some(logger) = PY_LOGGER.get() {
            if let Ok(mut filter) = logger.filter.lock() {
                *filter = level;
            }
        }
        log::set_max_level(level);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_names_parse_case_insensitively() {
        assert_eq!(parse_level("DEBUG"), Some(LevelFilter::Debug));
        assert_eq!(parse_level(" trace "), Some(LevelFilter::Trace));
        assert_eq!(parse_level("loud"), None);
    }
}
