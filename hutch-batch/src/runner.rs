//! Tools for initializing logging in the final binaries.
use anyhow::{anyhow, Result};
use std::env;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq)]
pub enum LogFormat {
    Human,
    Json,
}

pub struct TracingState {
    /// Once this is dropped tracing logs are ignored
    _guard: WorkerGuard,
}

/// Returns a new `EnvFilter` by parsing each directive string, or an error if any directive is invalid.
/// The parsing is robust to formatting, but will reject the first invalid directive (e.g. bad log level).
fn try_parse_log_directives(directives: &[Option<&str>]) -> Result<EnvFilter> {
    let directives: Vec<Directive> = directives
        .iter()
        .flat_map(Option::as_deref)
        .flat_map(|s| s.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(|e| anyhow!("{}: {}", e, s)))
        .collect::<Result<_>>()?;

    let filter = directives
        .into_iter()
        .fold(EnvFilter::default(), |filter, directive| {
            filter.add_directive(directive)
        });

    Ok(filter)
}

impl TracingState {
    /// Logs are written to stderr, stdout is reserved for the json results of each command.
    pub fn new(log_level: &str, format: LogFormat) -> Result<Self> {
        let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());

        // Load log directives from the config file and then from the RUST_LOG env var, with the latter taking priority.
        let overrides = env::var(EnvFilter::DEFAULT_ENV).ok();
        let env_filter = try_parse_log_directives(&[Some(log_level), overrides.as_deref()])?;

        let builder = tracing_subscriber::fmt()
            .with_writer(non_blocking)
            .with_env_filter(env_filter);
        match format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Human => builder.try_init(),
        }
        .map_err(|e| anyhow!(e))?;

        Ok(TracingState { _guard: guard })
    }
}
