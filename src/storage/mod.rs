//! Storage module for detection history and uploaded images

pub mod traits;
pub mod sqlite;
pub mod memory;
pub mod upload;

pub use traits::{DetectionStore, ImageUploader};
pub use sqlite::SqliteStorage;
pub use memory::MemoryStorage;
pub use upload::LocalUploader;
