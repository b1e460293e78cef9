//! Services module for invoicing-engine.

pub mod database;
pub mod metrics;
pub mod sequence;

pub use database::Database;
pub use metrics::{get_metrics, init_metrics};
pub use sequence::{InMemorySequencer, PgSequencer, Sequencer};
