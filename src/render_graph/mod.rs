//! Render Graph System
//!
//! Passes are registered in order with a setup callback that declares their
//! texture reads and writes through a [`Builder`]. `compile` realizes every
//! texture and pass object; `execute` runs the enabled passes in registration
//! order and chains them with semaphores. Passes are never reordered.

pub mod builder;
pub mod graph;
pub mod pass;
pub mod registry;
pub mod resource;

pub use builder::*;
pub use graph::*;
pub use pass::*;
pub use registry::*;
pub use resource::*;
