pub mod audit;
pub mod clock;
pub mod commitment;
pub mod config;
pub mod duration;
pub mod errors;
pub mod liquid;
pub mod mail;
pub mod models;
pub mod quota;
pub mod reports;

pub use clock::{Clock, SystemClock};
pub use duration::CommitmentDuration;
pub use errors::QuotaError;
pub use models::*;
