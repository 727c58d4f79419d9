//! Tracing subscriber setup
//!
//! Events go to stdout (coloured on a terminal, JSON lines on request) and,
//! when a log file is given, are mirrored as plain lines into that file. The
//! file is truncated at startup.

use std::fs::File;
use std::io::{self, IsTerminal};
use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

use crate::error::{Error, Result};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Default filter directive for a `-v` count; `RUST_LOG` takes precedence
pub fn filter_directive(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "mmwave_mtl=info,warn",
        1 => "mmwave_mtl=debug,info",
        2 => "mmwave_mtl=trace,debug",
        _ => "trace",
    }
}

fn env_filter(verbosity: u8) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_directive(verbosity)))
}

pub fn init_logging(verbosity: u8, json_output: bool, log_file: Option<&Path>) -> Result<()> {
    let mut layers: Vec<BoxedLayer> = Vec::with_capacity(2);

    let stdout_layer = if json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_filter(env_filter(verbosity))
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_ansi(io::stdout().is_terminal())
            .with_filter(env_filter(verbosity))
            .boxed()
    };
    layers.push(stdout_layer);

    if let Some(path) = log_file {
        let file = File::create(path)
            .map_err(|e| Error::config(format!("Cannot open log file {}: {}", path.display(), e)))?;
        layers.push(
            fmt::layer()
                .with_writer(Arc::new(file))
                .with_target(false)
                .with_ansi(false)
                .with_filter(env_filter(verbosity))
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(layers)
        .try_init()
        .map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive_by_verbosity() {
        assert_eq!(filter_directive(0), "mmwave_mtl=info,warn");
        assert_eq!(filter_directive(1), "mmwave_mtl=debug,info");
        assert_eq!(filter_directive(7), "trace");
    }
}
