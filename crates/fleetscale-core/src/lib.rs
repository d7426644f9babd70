pub mod config;
pub mod duration;

pub use config::FleetConfig;
pub use duration::parse_duration_secs;
