//! Framegraph - a frame graph execution engine
//!
//! Passes declare the textures they read and write during setup. The graph
//! creates those textures, wires each pass's input descriptor set, framebuffer
//! and pipelines, decides every frame which passes run, and chains their GPU
//! submissions with semaphores.
//!
//! Two backends implement the object and command seam:
//! - **Dummy**: records every call, used for tests and headless development
//! - **Vulkan**: headless ash backend (feature `vulkan-backend`)
//!
//! # Example
//! ```
//! use framegraph::backend::*;
//! use framegraph::render_graph::*;
//!
//! let mut graph: RenderGraph<DummyBackend, u32> = RenderGraph::new(DummyBackend::new());
//! graph.add_pass_with_enable(
//!     "clear",
//!     PassKind::Graphics,
//!     |builder| {
//!         let target = builder.create_texture(
//!             "color",
//!             ImageDescriptor::new_2d(64, 64, TextureFormat::Rgba8Unorm, TextureUsage::RENDER_ATTACHMENT),
//!         );
//!         builder.write_texture(target, AttachmentRole::Color, Subresource::default());
//!         |_registry: &Registry<'_, u32>, _recorder: &mut dyn CommandRecorder| {}
//!     },
//!     EnableCheck::with_registry(|registry: &Registry<'_, u32>| *registry.user_data() > 0),
//! );
//! graph.compile().unwrap();
//! graph.execute(&1, None, None, None).unwrap();
//! assert_eq!(graph.backend().submitted_labels(), vec!["clear"]);
//! ```

pub mod backend;
pub mod render_graph;

pub use backend::DummyBackend;
#[cfg(feature = "vulkan-backend")]
pub use backend::vulkan::{VulkanBackend, VulkanConfig};
pub use render_graph::{GraphError, GraphResult, RenderGraph};

/// Backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendType {
    /// Recording backend, no GPU required
    #[default]
    Dummy,
    /// Vulkan backend via ash (requires the `vulkan-backend` feature)
    Vulkan,
}

impl BackendType {
    /// Whether this backend was compiled in
    pub fn is_available(self) -> bool {
        match self {
            BackendType::Dummy => true,
            BackendType::Vulkan => cfg!(feature = "vulkan-backend"),
        }
    }
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dummy" => Ok(BackendType::Dummy),
            "vulkan" | "vk" => Ok(BackendType::Vulkan),
            other => Err(format!("unknown backend '{}', expected dummy or vulkan", other)),
        }
    }
}

/// Configuration for a render graph
#[derive(Debug, Clone)]
pub struct GraphConfig {
    /// Name used in log messages
    pub label: String,
    /// Which backend the caller intends to create
    pub backend: BackendType,
    /// Enable backend validation (Vulkan validation layers)
    pub validation: bool,
    /// Run `validate_order` at the end of every `compile`
    pub validate_order: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            label: "frame".to_string(),
            backend: BackendType::Dummy,
            validation: cfg!(debug_assertions),
            validate_order: true,
        }
    }
}
