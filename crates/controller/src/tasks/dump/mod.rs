pub mod archive;
pub mod controller;
pub mod executor;
pub mod locator;
pub mod metrics;
pub mod session;
pub mod status;

pub use controller::{DumpReconciler, ReconcileOutcome};
pub use executor::{DumpDispatch, DumpExecutor};
pub use locator::ArchiveLocator;
pub use metrics::{DumpMetrics, MetricsSnapshot};
pub use session::{SessionGuard, SessionRegistry};
pub use status::StatusReporter;
