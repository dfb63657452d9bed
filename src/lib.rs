pub mod core;
pub mod engine;
pub mod error;
pub mod models;
pub mod usecases;

pub use engine::{ModelEngine, ModelEngineBuilder};
pub use error::{ChecksumSource, DownloadError, EngineError};
