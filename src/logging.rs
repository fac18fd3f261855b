use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable holding `tracing` filter directives, e.g. `trackpipe=debug`.
pub const LOG_ENV_VAR: &str = "TRACKPIPE_LOG";

/// Initialize structured JSON logging on stderr.
///
/// Defaults to `error` level unless overridden by `TRACKPIPE_LOG`.
pub fn init() {
    init_with_default(LevelFilter::ERROR);
}

/// Like `init`, with a different level for when `TRACKPIPE_LOG` is unset.
///
/// Decode steps log at `debug` and individual flushes at `trace`. Only the first call installs a
/// subscriber.
pub fn init_with_default(default_level: LevelFilter) {
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_span_list(true),
        )
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init();
        init_with_default(LevelFilter::DEBUG);
        init();
    }
}
