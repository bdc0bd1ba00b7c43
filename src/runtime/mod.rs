/// Runtime Execution Engine
///
/// Executes flows one subject at a time as a persisted state machine:
/// - Execution contexts and scoped variables backed by SQLite
/// - Node handlers behind one trait, closed over the node-type enum
/// - A re-entrant dispatcher loop with a per-invocation step cap
/// - Atomic claim of waiting contexts on inbound events and on wait expiry
/// - Error classification, retry and fallback-flow escalation
/// - Step traces and passive timing aggregates

// Persistence of contexts, variables, traces and recovery bookkeeping
pub mod store;

// Execution context lifecycle and variable scopes
pub mod context;

// Inbound events delivered by the transport
pub mod events;

// Outbound transport collaborator
pub mod transport;

// Subject directory and phone normalization for contact matching
pub mod contacts;

// `{name}` placeholder rendering
pub mod template;

// Structured and free-form (Lua) condition evaluation
pub mod condition;

// Handler contract and registry
pub mod executor;

// One handler per node type
pub mod nodes;

// Failure classification and recovery decisions
pub mod recovery;

// Step trace feed and performance monitor
pub mod telemetry;

// Node dispatcher control loop
pub mod engine;

// Resume of waiting contexts and the expired-wait sweep
pub mod coordinator;

// Public engine facade
pub mod service;

// Cron-driven sweep of expired waits
pub mod scheduler;

pub use context::{ExecutionContext, ExecutionStatus, Subject, WaitType};
pub use engine::{Dispatcher, RunOutcome};
pub use events::{ContactInfo, EventKind, EventPayload, InboundEvent};
pub use scheduler::SweepScheduler;
pub use service::{ExecutionStatusView, FlowService, InboundOutcome, StartedRun};
pub use telemetry::StepTrace;
pub use transport::{HttpTransport, LogTransport, MemoryTransport, OutboundMessage, Transport};
