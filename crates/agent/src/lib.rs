//! Agent runtime for Tandem.
//!
//! A user message flows through the [`orchestrator`]: the bearer token is
//! resolved, the conversation loaded, the message classified into an intent
//! ([`classifier`]) and handed to the matching node ([`nodes`]). Nodes talk to
//! the model through [`llm::LlmClient`] and act through the schema-validated
//! [`tools`] registry; calendar reads and provider sync live in [`calendar`].
//!
//! # Safety Principle
//!
//! The model only proposes actions. Slot search, conflict detection, proposal
//! expiry and form validation are deterministic and never delegated to it.

pub mod broadcast;
pub mod calendar;
pub mod classifier;
pub mod llm;
pub mod nodes;
pub mod notify;
pub mod orchestrator;
pub mod tools;

pub use broadcast::{BroadcastHub, SurfaceBroadcaster, SurfaceUpdate};
pub use calendar::{CalendarError, CalendarProvider, CalendarService, SyncSummary};
pub use classifier::IntentClassifier;
pub use llm::{HttpLlmClient, LlmClient, LlmError, MockLlm, TimeoutLlm};
pub use nodes::{AgentDeps, AgentError, AgentUpdate};
pub use notify::{LogNotifier, Notifier};
pub use orchestrator::{AgentRequest, AgentResponse, Orchestrator, OrchestratorError};
pub use tools::{Tool, ToolContext, ToolError, ToolRegistry};
