// ABOUTME: Shared logging setup for agentcomm binaries
// ABOUTME: Two functions: init() for stderr, init_for() for crate-filtered stderr

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Standard logging to stderr. Default: INFO level, RUST_LOG override.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Crate-filtered logging to stderr. The named crates log at `level`, everything
/// else at WARN. RUST_LOG directives are applied on top.
///
/// A binary should name its own crate alongside the libraries it drives.
pub fn init_for(crate_names: &[&str], level: Level) {
    tracing_subscriber::fmt()
        .with_env_filter(filter_for(crate_names, level))
        .with_writer(std::io::stderr)
        .init();
}

fn filter_for(crate_names: &[&str], level: Level) -> EnvFilter {
    crate_names.iter().fold(
        EnvFilter::from_default_env().add_directive(Level::WARN.into()),
        |filter, name| match format!("{name}={level}").parse() {
            Ok(directive) => filter.add_directive(directive),
            Err(_) => filter,
        },
    )
}
