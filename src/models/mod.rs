pub mod reading;

pub use reading::{Payload, Reading, SensorKind};
