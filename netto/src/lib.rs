pub mod arbiter;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod monitor;
pub mod policy;
pub mod process;
