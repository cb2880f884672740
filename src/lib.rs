pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod model;
pub mod routes;
pub mod state;
pub mod storage;

pub use engine::Engine;
pub use error::{EngineError, Result};
