pub mod executor;
pub mod extract;
pub mod registry;
pub mod schema;

pub use executor::{calculate_backoff, classify, AttemptNotice, Executor, Invocation, ToolRun};
pub use extract::{extract, Extracted};
pub use registry::ToolRegistry;
pub use schema::SchemaRegistry;
