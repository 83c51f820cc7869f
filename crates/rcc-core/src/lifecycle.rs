//! Process lifecycle abstraction.
//!
//! Nothing in the RCC ever needs to restart itself; a call failing or a
//! sensor going away is recovered by its own component, not by the process.
//! The one lifecycle action the crate needs is a clean shutdown path that
//! components can request without reaching for `std::process::exit` directly.

/// Trait for requesting process shutdown.
///
/// The `rcc-device` binary installs [`ProcessLifecycle`]; tests and embedding
/// contexts use [`NoopLifecycle`].
pub trait Lifecycle: Send + Sync {
    /// Requests a graceful shutdown. The application should clean up
    /// resources (see `bootstrap::BootstrappedServices::shutdown`) and exit.
    fn request_shutdown(&self);
}

/// Lifecycle implementation for the standalone device binary.
pub struct ProcessLifecycle;

impl Lifecycle for ProcessLifecycle {
    fn request_shutdown(&self) {
        tracing::info!("shutdown requested");
        std::process::exit(0);
    }
}

/// No-op lifecycle for tests or embedding.
pub struct NoopLifecycle;

impl Lifecycle for NoopLifecycle {
    fn request_shutdown(&self) {
        tracing::debug!("shutdown requested (no-op)");
    }
}
