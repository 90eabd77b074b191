pub mod controller;
pub mod loop_worker;
pub mod transport;

pub use controller::SyncController;
pub use loop_worker::{PassOutcome, SyncConfig, SyncEngine, SyncError};
pub use transport::{Ack, CollectorSession, TransportError};
