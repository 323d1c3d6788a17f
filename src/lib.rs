pub mod cleanup;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod errors;
pub mod events;
pub mod git;
pub mod health;
pub mod init;
pub mod integration;
pub mod logging;
pub mod models;
pub mod monitor;
pub mod ports;
pub mod preview;
pub mod runner;
pub mod stream;

pub use engine::{Engine, ExecutionRequest, RefRequest};
pub use errors::{EngineError, EngineResult};
