use tracing_subscriber::EnvFilter;

/// Install the global subscriber, writing to stderr.
///
/// `RUST_LOG` wins when set. Otherwise the configured level applies, raised
/// one step per `-v`: `-v` shows info, `-vv` debug and `-vvv` trace.
pub fn init_tracing(configured: &str, verbosity: u8) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level(configured, verbosity)));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).with_target(false).init();
}

fn level(configured: &str, verbosity: u8) -> &str {
    const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    let Some(base) = LEVELS.iter().position(|l| l.eq_ignore_ascii_case(configured.trim())) else {
        // Not a plain level, so treat it as a filter directive.
        return configured;
    };
    LEVELS[(base + usize::from(verbosity)).min(LEVELS.len() - 1)]
}
