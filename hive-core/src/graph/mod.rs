pub mod executor;
pub mod spec;

pub use executor::{ExecutionReport, ExecutionStatus, GraphExecutor, ResumePoint};
pub use spec::{
    ConfigError, EdgeCondition, EdgePredicate, EdgeSpec, EntryPointSpec, FunctionHandler,
    GraphSpec, NodeSpec, NodeType, OutputKey, TriggerKind,
};
