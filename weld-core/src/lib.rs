//! weld-core — structured-concurrency substrate for composing
//! asynchronous streaming pipelines out of independent sections.
//!
//! A pipeline is built from [`section::PipelineSection`] nodes and
//! composed by [`weld::weld`] into a single output stream; [`pipeline::Pipeline`]
//! wraps that process with lazy start, multi-consumer fan-out
//! ([`tap::Tap`]), and dynamic extension, all scoped to a structured
//! concurrency group ([`scope::Scope`]) that cancels as a unit.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod channel;
pub mod config;
pub mod metrics;
pub mod pipeline;
pub mod scope;
pub mod section;
pub mod tap;
pub mod weld;

mod error;
pub use error::{Error, Result};

/// Installs a `tracing_subscriber` layer honoring `RUST_LOG`, defaulting
/// to `info`. Call once at process startup.
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
    tracing::info!("weld-core initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic() {
        init();
    }
}
