//! Tracing/logging initialization.
//!
//! JSON lines on stdout. The filter comes from `RUST_LOG` and falls back to
//! [`DEFAULT_FILTER`].

use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "info";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init() {
    let _ = try_init();
}

/// Like [`init`], but reports whether this call installed the subscriber.
pub fn try_init() -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(filter())
        .json()
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .with_target(false)
        .with_current_span(true)
        .try_init()
        .is_ok()
}

fn filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_init_is_a_no_op() {
        try_init();
        assert!(!try_init());
        ::tracing::info!("still logging after repeated init");
    }
}
