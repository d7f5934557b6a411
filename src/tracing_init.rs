//! Tracing setup for the command-line tool and unit tests
//!
//! Both read `RUST_LOG`, e.g. `RUST_LOG=chargescan=debug` or
//! `RUST_LOG=chargescan::pulse=trace` to follow each pulse fit.

#[cfg(test)]
use once_cell::sync::Lazy;

/// Install a test-captured subscriber, defaulting to `chargescan=warn`.
///
/// Safe to call from every test; only the first call installs it.
#[cfg(test)]
pub fn init_test_tracing() {
    static TRACING: Lazy<()> = Lazy::new(|| {
        use tracing_subscriber::{fmt, EnvFilter};

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chargescan=warn"));

        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_line_number(true)
            .with_test_writer()
            .init();
    });

    Lazy::force(&TRACING);
}

/// Install the subscriber for the binary, defaulting to `chargescan=info`.
///
/// Logs go to stderr so tables printed on stdout stay clean.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chargescan=info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();
}
