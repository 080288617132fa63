pub mod config;
pub mod error;
pub mod flow;
pub mod http;
pub mod report;

// Re-export common items
pub use config::RunConfig;
pub use error::FlowError;
pub use flow::{run_scenarios, Scenario};
