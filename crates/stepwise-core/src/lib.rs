pub mod config;
pub mod data;
pub mod error;
pub mod event;
pub mod reference;
pub mod schema;
pub mod traits;
pub mod types;

pub use config::StepwiseConfig;
pub use data::{AccumulatedData, Entry};
pub use error::{Result, StepwiseError};
pub use event::EventBus;
pub use reference::{Segment, SourcePattern};
pub use schema::{Extractor, FollowUpPolicy, InputSpec, OutputField, ToolSchema};
pub use types::*;
