pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod source;

pub use config::EngineConfig;
pub use engine::{TitleEngine, UpdateOutcome, UpdateStatus};
pub use error::EngineError;
