pub mod pending;

pub use pending::PendingReading;
