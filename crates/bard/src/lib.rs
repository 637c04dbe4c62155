//! Bundle Archival Restaging Daemon.
//!
//! Enforces per-endpoint storage quotas on in-flight bundles and, when
//! internal storage is exhausted, offloads (restages) bundles to an
//! external filesystem for later reload.
//!
//! The pieces:
//!
//! - [`daemon::Bard`] is the acceptance oracle and the registry of quota,
//!   usage and restage-link records. Every admission decision runs through
//!   [`daemon::Bard::query_accept_bundle`], which reserves capacity; the
//!   bookkeeping notifications (`bundle_accepted`, `bundle_restaged`,
//!   `bundle_deleted`, ...) move those reservations through their
//!   lifecycle.
//! - [`restage::RestageController`] is one external-storage location with
//!   its Restager and Reloader worker threads.
//! - [`cmd`] is the `bard ...` operator command surface.
//! - [`store`] is durable persistence for quota configuration and IMC
//!   region/group records.

pub mod bundle;
pub mod cmd;
pub mod daemon;
pub mod dtntime;
pub mod error;
mod force_restage;
pub mod imc;
pub mod link;
mod report;
pub mod restage;
pub mod runtime;
pub mod store;
pub mod usage;

pub use bundle::{Bundle, PendingBundles};
pub use daemon::{Bard, BardParams};
pub use error::{BardError, Result};
pub use link::Link;

/// The inbound path reloaded bundles are handed to.
///
/// The node harness wires this to its receive pipeline; the daemon's
/// acceptance and accounting calls are the implementor's responsibility,
/// exactly as for a bundle arriving off a wire.
pub trait BundleSink: Send + Sync {
    fn deliver(&self, bundle: Bundle) -> Result<()>;
}
