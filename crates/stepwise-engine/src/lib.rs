pub mod engine;
pub mod evaluator;
pub mod follow_up;
pub mod resolver;
pub mod run_log;
pub mod task;
pub mod validate;

pub use engine::{ExecutionEngine, Mode, TaskReport};
pub use evaluator::CompletenessEvaluator;
pub use follow_up::{Chain, FollowUpPlanner};
pub use resolver::{DataFlowResolver, Provenance, ResolvedParameters};
pub use run_log::RunLogger;
pub use task::{TaskHandle, TaskManager, TaskOutcome};
pub use validate::PlanValidator;
