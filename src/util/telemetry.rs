//! Telemetry helpers for structured logging.

/// Initialize tracing for the pipeline. Embedders can install their own
/// subscriber first; this helper installs a default env-based subscriber
/// (`RUST_LOG`) only if none is set, so calling it twice is harmless.
pub fn init_tracing() {
    if tracing::dispatcher::has_been_set() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(true)
        .try_init();
}

/// Install a test-friendly subscriber writing through the libtest capture.
/// Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
