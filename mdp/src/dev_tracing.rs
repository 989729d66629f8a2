//! Opt-in structured logging, enabled only when `RUST_LOG` is set so
//! library consumers and tests aren't forced to see broker chatter.

/// Install a `tracing` subscriber reading filters from `RUST_LOG`. No-op
/// if the variable isn't set, or if a subscriber is already installed.
pub fn init_tracing() {
    use std::env;
    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }
}
