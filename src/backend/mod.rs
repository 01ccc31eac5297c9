//! Backend abstraction layer
//!
//! Provides the traits and types the frame graph consumes, plus a recording
//! dummy backend and a headless Vulkan backend.

pub mod dummy;
pub mod traits;
pub mod types;

#[cfg(feature = "vulkan-backend")]
pub mod vulkan;

pub use dummy::DummyBackend;
pub use traits::*;
pub use types::*;
