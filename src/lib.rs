//! scriptdeck: register scripts, compose them into linear chains, run them on
//! demand or on a cron schedule, and observe live progress and history.
//!
//! The crate is organised around the execution engine: process supervision
//! with realtime output streaming ([`crate::core::supervisor`]), host and
//! container executors ([`crate::core::executor`]), content-hash script
//! versioning ([`crate::core::version`]), the background scheduler loop
//! ([`crate::core::scheduler`]) and alert evaluation on terminal executions
//! ([`crate::core::alert`]). Metadata lives in SQLite behind
//! [`crate::core::store::Store`].

pub mod config;
pub mod core;
pub mod logging;

pub use crate::config::EngineConfig;
pub use crate::core::engine::{ExecTarget, ExecutionEngine};
pub use crate::core::envelope::ParamEnvelope;
pub use crate::core::error::EngineError;
pub use crate::core::interpreter::InterpreterKind;
pub use crate::core::store::Store;
