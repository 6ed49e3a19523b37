//! Shared helpers

pub mod image;
pub mod logging;
pub mod math;
