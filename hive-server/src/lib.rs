//! HTTP + SSE boundary for the hive runtime.
//!
//! The engine lives in `hive-core`; this crate only maps the session
//! manager onto the REST surface and frames bus events as SSE.

pub mod llm_stub;
pub mod routes;
pub mod sse;
