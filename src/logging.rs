//! Tracing subscriber setup.

/// Maps `-v`/`-q` flags to a default filter directive.
///
/// `quiet` wins over any verbosity count.
#[must_use]
pub fn default_level(verbose: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Installs a stderr `fmt` subscriber.
///
/// `RUST_LOG` overrides `default_level`. Calling this more than once is a
/// no-op, so tests can call it freely.
pub fn init_tracing(default_level: &str, no_color: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(!no_color)
        .with_env_filter(filter)
        .try_init();
}
