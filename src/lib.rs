//! # Chorus Core
//!
//! Chorus Core is a multi-agent orchestration engine. Incoming chat requests
//! are classified by intent, optionally planned into steps, executed by
//! specialist agents under a concurrency-bounded scheduler, validated by a
//! quality controller, and narrated to clients as a stream of unified
//! progress events.
//!
//! ## Architecture
//!
//! - **Manager Orchestrator**: top-level control loop per request
//! - **Agent Registry & Scheduler**: bounded dispatch, interrupts, retries
//! - **LLM Gateway**: provider-agnostic generation with caching and accounting
//! - **Retrieval Layer**: parallel multi-store search with dedup and caching
//! - **Event Bus**: per-session broadcast fabric with a persistence sink
//! - **Session Store**: conversation turns and append-only event streams
//!
//! The engine is typically run as a standalone service exposing a thin HTTP
//! surface (message submission, SSE event streaming, interrupts).

/// Specialist agent implementations
pub mod agents;
/// HTTP API server and endpoints
pub mod api;
/// LLM-based query classification
pub mod classifier;
/// System configuration
pub mod config;
/// System-wide constants
pub mod constants;
/// Error types and taxonomy
pub mod error;
/// Unified events and broadcast bus
pub mod events;
/// Provider-agnostic LLM gateway
pub mod llm;
/// Manager orchestrator and planner
pub mod manager;
/// Inter-agent message protocol
pub mod messages;
/// Core data models
pub mod models;
/// Prompt template registry
pub mod prompts;
/// Answer validation and retry-with-feedback
pub mod quality;
/// Multi-store retrieval layer
pub mod retrieval;
/// Agent registry and task scheduler
pub mod scheduler;
/// Session management and persistence
pub mod session;
/// Startup dependency container
pub mod system;

#[cfg(test)]
mod tests;

pub use error::{ChorusError, ErrorKind, Result};
