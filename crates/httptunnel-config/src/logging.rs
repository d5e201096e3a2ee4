use std::fs::{File, OpenOptions};
use std::path::PathBuf;
use std::sync::{Mutex, Once};

use serde::{Deserialize, Serialize};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

const DEFAULT_LEVEL: &str = "info";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// A plain level (`warn`, `debug`, ...) or any `EnvFilter` directive string.
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,

    #[serde(default = "default_stderr")]
    pub stderr: bool,

    /// Log file to append to, alongside stderr. A file that cannot be opened is skipped
    /// with a warning.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

fn default_level() -> String {
    DEFAULT_LEVEL.to_owned()
}

fn default_stderr() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
            stderr: default_stderr(),
            file: None,
        }
    }
}

impl LoggingConfig {
    /// The filter for the configured level, with `RUST_LOG` directives layered on top.
    ///
    /// Falls back to `RUST_LOG` alone, then to the configured level alone, then to `info`
    /// when a combination does not parse.
    pub fn env_filter(&self) -> EnvFilter {
        let level = normalize_level(&self.level);
        let rust_log = std::env::var("RUST_LOG")
            .ok()
            .map(|value| value.trim().to_owned())
            .filter(|value| !value.is_empty());

        let mut candidates = Vec::with_capacity(3);
        if let Some(rust_log) = rust_log {
            candidates.push(format!("{level},{rust_log}"));
            candidates.push(rust_log);
        }
        candidates.push(level);

        candidates
            .into_iter()
            .find_map(|directives| EnvFilter::try_new(directives).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_LEVEL))
    }
}

/// Accepts level names in any case, and `warning` for `warn`.
fn normalize_level(input: &str) -> String {
    let level = input.trim();
    if level.is_empty() {
        return default_level();
    }
    let lower = level.to_ascii_lowercase();
    match lower.as_str() {
        "warning" => "warn".to_owned(),
        "trace" | "debug" | "info" | "warn" | "error" => lower,
        _ => level.to_owned(),
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, json: bool) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
    if json {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

static INIT: Once = Once::new();

/// Installs the global `tracing` subscriber described by `logging`.
///
/// Only the first call in a process does anything; it returns whether the subscriber was
/// installed by this call.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let mut installed = false;
    INIT.call_once(|| {
        let mut sinks: Vec<BoxedLayer> = Vec::new();
        if logging.stderr {
            sinks.push(fmt_layer(std::io::stderr, logging.json));
        }

        let mut unopened = None;
        if let Some(path) = &logging.file {
            match OpenOptions::new().create(true).append(true).open(path) {
                Ok(file) => sinks.push(fmt_layer(Mutex::<File>::new(file), logging.json)),
                Err(err) => unopened = Some((path, err)),
            }
        }

        let subscriber = tracing_subscriber::registry()
            .with(sinks)
            .with(logging.env_filter());
        installed = tracing::subscriber::set_global_default(subscriber).is_ok();

        if let (true, Some((path, err))) = (installed, unopened) {
            tracing::warn!(
                target: "httptunnel.config",
                path = %path.display(),
                error = %err,
                "cannot open log file; logging to the remaining sinks"
            );
        }
    });
    installed
}
