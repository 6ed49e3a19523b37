//! Facial Emotion Detection Service Library

pub mod config;
pub mod engine;
pub mod error;
pub mod service;
pub mod storage;
pub mod api;
pub mod utils;

pub use config::Config;
pub use error::{CompletionError, DetectionError, ValidationError};
