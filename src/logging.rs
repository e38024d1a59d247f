//! Diagnostic tracing for operators.
//!
//! Tracing goes to stderr and is filtered by `RUST_LOG`. It is not the audit
//! log: audit entries are product records persisted in the database and are
//! written regardless of the filter.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber. `RUST_LOG` wins; otherwise `warn`, or
/// `debug` for this crate when `verbose` is set.
pub fn init(verbose: bool) {
    let default = if verbose { "warn,sliceforge=debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    // A second call (tests driving `main` twice) keeps the first subscriber.
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .compact(),
        )
        .try_init();
}
