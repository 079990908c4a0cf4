//! Multi-phase workbook migration.
//!
//! Drives Ingest -> Validate -> Apply -> Reconcile per job against a
//! Postgres store: [`store`] persists job and staging state with the
//! uniqueness constraints that make every stage idempotent under retry,
//! [`validation`] runs the set-based SQL rule engine, [`apply`] moves
//! validated rows into master tables, and [`orchestrator`] sequences the
//! phases with per-sheet parallelism, timeouts, and checkpointing.

pub mod apply;
pub mod orchestrator;
pub mod store;
pub mod validation;

pub use apply::ApplyTarget;
pub use orchestrator::{MigrationOrchestrator, MigrationRequest, SheetPlan};
pub use validation::{StepMetric, ValidationReport, ValidationRule};
