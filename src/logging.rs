use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_ENV: &str = "ISLECTL_LOG";

pub fn default_directive(verbose: bool) -> &'static str {
    if verbose {
        "islectl=debug,info"
    } else {
        "warn"
    }
}

/// Logs go to stderr so they never interleave with command output on stdout.
pub fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbose)));
    let layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time();
    // A second init (tests) leaves the first subscriber in place.
    let _ = tracing_subscriber::registry().with(filter).with(layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_raises_crate_level() {
        assert_eq!(default_directive(false), "warn");
        assert!(default_directive(true).contains("islectl=debug"));
        assert!(EnvFilter::try_new(default_directive(true)).is_ok());
    }

    #[test]
    fn init_is_repeatable() {
        init_logging(false);
        init_logging(true);
    }
}
