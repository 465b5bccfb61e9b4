pub mod alert;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod interpreter;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod version;
