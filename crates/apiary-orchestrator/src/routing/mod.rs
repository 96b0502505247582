//! Candidate resolution and task routing.
//!
//! This module turns raw task requests into fully specified, load-balanced
//! agent tasks: the resolver builds the per-capability candidate ladder,
//! the router assigns providers across it, and the circuit breaker tracks
//! per-destination inference failures.

pub mod circuit_breaker;
pub mod resolver;
pub mod router;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitState};
pub use resolver::{ModelCandidate, ModelSpec, Resolver};
pub use router::{AgentTask, RawTask, RoleBook, RoleSpec, Router};
