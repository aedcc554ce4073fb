//! ```text
//! trigger ─► SessionManager ─► ExecutionStream ─► GraphExecutor
//!                │                                    │
//!                ├─► queen (EventLoopNode)            ├─► EventLoopNode ─► LlmClient / ToolRegistry
//!                ├─► health judge                     │        │
//!                │                                    │        └─► JudgeProtocol (verdict)
//!                └─► SSE subscribers ◄── EventBus ◄───┴─► SharedState / CheckpointStore
//! ```
//!
//! Hive is a runtime for LLM-driven agents defined as directed graphs of
//! nodes. Each session pairs an always-on conversational executor (the
//! queen) with optional graph executors (workers) and a scheduled health
//! evaluator (the judge). Every internal state change flows through the
//! session's [`event::EventBus`] as a typed [`event::AgentEvent`].

pub mod checkpoint;
pub mod config;
pub mod conversation;
pub mod event;
pub mod graph;
pub mod judge;
pub mod llm;
pub mod node;
pub mod prompt;
pub mod session;
pub mod state;
pub mod stream;
pub mod tools;
