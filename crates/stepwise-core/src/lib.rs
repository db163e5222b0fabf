pub mod config;
pub mod error;
pub mod event;
pub mod types;

pub use config::StepwiseConfig;
pub use error::{Result, StepwiseError};
pub use event::EventBus;
pub use types::*;
