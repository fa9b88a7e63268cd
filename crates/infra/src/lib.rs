//! Infrastructure layer: job store, ledger and synthesis adapters, and the
//! workers that drive jobs through the pipeline.

pub mod ingest;
pub mod jobs;
pub mod ledger;
pub mod reconcile;
pub mod synthesis;

pub use ingest::IngestionListener;
pub use reconcile::{GapReconciler, ReconcileError, ReconcileOptions, ReconcileReport};
