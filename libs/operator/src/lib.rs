pub mod controller;
pub mod error;
pub mod helm;
pub mod metrics;
pub mod reconciler;
pub mod status;
pub mod telemetry;
pub mod values;
pub mod watches;

pub use error::{Error, Result};
