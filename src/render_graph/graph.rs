//! Render graph definition, compilation and execution

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::builder::Builder;
use crate::render_graph::pass::*;
use crate::render_graph::registry::Registry;
use crate::render_graph::resource::*;
use crate::GraphConfig;
use std::fmt::Write as _;
use thiserror::Error;

/// Render graph error type
#[derive(Error, Debug)]
pub enum GraphError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Pass '{pass}' has not been compiled")]
    NotCompiled { pass: String },
}

pub type GraphResult<T> = Result<T, GraphError>;

/// A read that happens, in registration order, before every write of the same texture
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderHazard {
    pub texture: String,
    pub reader: String,
    pub writers: Vec<String>,
}

/// The main render graph structure.
///
/// Passes run in registration order. Consecutive enabled passes are chained with
/// semaphores so a pass never starts before the previous one finished.
pub struct RenderGraph<B: GraphicsBackend, U: 'static = ()> {
    config: GraphConfig,
    resources: ResourceManager,
    passes: Vec<PassNode<U>>,
    semaphores: Vec<SemaphoreHandle>,
    backend: B,
}

impl<B: GraphicsBackend, U: 'static> RenderGraph<B, U> {
    pub fn new(backend: B) -> Self {
        Self::with_config(backend, GraphConfig::default())
    }

    pub fn with_config(backend: B, config: GraphConfig) -> Self {
        log::info!(
            "Creating render graph '{}' on the {} backend",
            config.label,
            backend.name()
        );
        Self {
            config,
            resources: ResourceManager::new(),
            passes: Vec::new(),
            semaphores: Vec::new(),
            backend,
        }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceManager {
        &mut self.resources
    }

    pub fn create_texture(&mut self, name: &str, desc: ImageDescriptor) -> TextureHandle {
        self.resources.create_texture(name, desc)
    }

    pub fn import_texture(&mut self, name: &str, image: ImageHandle, desc: ImageDescriptor) -> TextureHandle {
        self.resources.import_texture(name, image, desc)
    }

    /// Handle of an existing texture. Panics if `name` is unknown.
    pub fn texture(&self, name: &str) -> TextureHandle {
        self.resources.handle(name)
    }

    /// Add a pass built from closures. `setup` runs immediately and returns the
    /// callback executed every frame.
    pub fn add_pass<S, E>(&mut self, name: &str, kind: PassKind, setup: S)
    where
        S: FnOnce(&mut Builder<'_>) -> E,
        E: FnMut(&Registry<'_, U>, &mut dyn CommandRecorder) + 'static,
    {
        self.add_pass_with_enable(name, kind, setup, EnableCheck::Always);
    }

    /// Like [`RenderGraph::add_pass`], gated every frame by `enable`.
    pub fn add_pass_with_enable<S, E>(
        &mut self,
        name: &str,
        kind: PassKind,
        setup: S,
        enable: EnableCheck<U>,
    ) where
        S: FnOnce(&mut Builder<'_>) -> E,
        E: FnMut(&Registry<'_, U>, &mut dyn CommandRecorder) + 'static,
    {
        self.warn_duplicate(name);
        let mut layout = PassLayout::default();
        let mut builder = Builder::new(name, kind, &mut self.resources, &mut layout);
        let execute = setup(&mut builder);
        builder.finish();

        let body = ClosurePass {
            execute: Box::new(execute),
            enable,
        };
        self.passes
            .push(PassNode::new(name, kind, layout, Box::new(body)));
    }

    /// Add a pass implemented as a type.
    pub fn add_struct_pass<P: RenderPass<U> + 'static>(&mut self, name: &str, mut pass: P) {
        self.warn_duplicate(name);
        let kind = pass.kind();
        let mut layout = PassLayout::default();
        let mut builder = Builder::new(name, kind, &mut self.resources, &mut layout);
        pass.setup(&mut builder);
        builder.finish();

        self.passes
            .push(PassNode::new(name, kind, layout, Box::new(StructPass(pass))));
    }

    fn warn_duplicate(&self, name: &str) {
        if self.passes.iter().any(|p| p.name() == name) {
            log::warn!(
                "Pass '{}' is registered twice; execute_alone will only find the first",
                name
            );
        }
    }

    /// Destroy every pass. The GPU must not be using them anymore.
    pub fn clear_all_passes(&mut self) {
        for pass in &mut self.passes {
            pass.destroy(&mut self.backend);
        }
        self.passes.clear();
    }

    /// Create all textures, initialize passes that are not initialized yet and
    /// rebuild the semaphore pool.
    pub fn compile(&mut self) -> GraphResult<()> {
        self.resources.create_all(&mut self.backend)?;

        for pass in &mut self.passes {
            if pass.state() == PassState::Built {
                pass.initialize(&mut self.backend, &mut self.resources)?;
            }
        }

        for semaphore in self.semaphores.drain(..) {
            self.backend.destroy_semaphore(semaphore);
        }
        for _ in 0..self.passes.len().saturating_sub(1) {
            self.semaphores.push(self.backend.create_semaphore()?);
        }

        if self.config.validate_order {
            self.validate_order();
        }

        log::debug!(
            "Compiled render graph '{}': {} textures, {} passes, {} semaphores",
            self.config.label,
            self.resources.len(),
            self.passes.len(),
            self.semaphores.len()
        );
        Ok(())
    }

    /// Run every enabled pass in registration order.
    ///
    /// The first enabled pass waits on `wait`, the last signals `signal` and
    /// `fence`. Nothing is submitted when no pass is enabled.
    pub fn execute(
        &mut self,
        user_data: &U,
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> GraphResult<()> {
        let mut enabled = Vec::with_capacity(self.passes.len());
        for (index, pass) in self.passes.iter_mut().enumerate() {
            if pass.is_enabled(user_data)? {
                enabled.push(index);
            }
        }
        if enabled.is_empty() {
            log::trace!("No pass enabled in render graph '{}'", self.config.label);
            return Ok(());
        }

        let mut chain = Vec::with_capacity(enabled.len() + 1);
        chain.push(wait);
        chain.extend(self.semaphores[..enabled.len() - 1].iter().copied().map(Some));
        chain.push(signal);

        for &index in &enabled {
            self.passes[index].record(user_data)?;
        }

        let last = enabled.len() - 1;
        for (slot, &index) in enabled.iter().enumerate() {
            let pass_fence = if slot == last { fence } else { None };
            self.passes[index].submit(chain[slot], chain[slot + 1], pass_fence)?;
        }
        Ok(())
    }

    /// Run the first pass named `name` on its own, outside the frame's chain.
    pub fn execute_alone(
        &mut self,
        name: &str,
        user_data: &U,
        wait: Option<SemaphoreHandle>,
        signal: Option<SemaphoreHandle>,
        fence: Option<FenceHandle>,
    ) -> GraphResult<()> {
        let Some(pass) = self.passes.iter_mut().find(|p| p.name() == name) else {
            log::warn!("execute_alone: no pass named '{}'", name);
            return Ok(());
        };
        if !pass.is_enabled(user_data)? {
            log::debug!("execute_alone: pass '{}' is disabled", name);
            return Ok(());
        }
        pass.record(user_data)?;
        pass.submit(wait, signal, fence)
    }

    /// Report reads that precede, in registration order, every write of the same texture.
    /// Passes are never reordered.
    pub fn validate_order(&self) -> Vec<OrderHazard> {
        let mut hazards = Vec::new();
        for (reader_index, reader) in self.passes.iter().enumerate() {
            for input in reader.layout().inputs() {
                let writers: Vec<usize> = self
                    .passes
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| p.layout().writes(input.handle))
                    .map(|(i, _)| i)
                    .collect();
                if writers.is_empty() || writers.iter().any(|&w| w <= reader_index) {
                    continue;
                }
                let hazard = OrderHazard {
                    texture: self.texture_name(input.handle),
                    reader: reader.name().to_string(),
                    writers: writers
                        .iter()
                        .map(|&w| self.passes[w].name().to_string())
                        .collect(),
                };
                log::warn!(
                    "Pass '{}' reads '{}' before it is written by {:?}",
                    hazard.reader,
                    hazard.texture,
                    hazard.writers
                );
                if !hazards.contains(&hazard) {
                    hazards.push(hazard);
                }
            }
        }
        hazards
    }

    fn texture_name(&self, handle: TextureHandle) -> String {
        if self.resources.contains(handle) {
            self.resources.node(handle).name().to_string()
        } else {
            format!("#{}", handle.index())
        }
    }

    /// Human-readable dump of every pass and its edges
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "render graph '{}': {} textures, {} passes",
            self.config.label,
            self.resources.len(),
            self.passes.len()
        );
        for pass in &self.passes {
            let reads: Vec<String> = pass
                .layout()
                .inputs()
                .iter()
                .map(|i| self.texture_name(i.handle))
                .collect();
            let writes: Vec<String> = pass
                .layout()
                .outputs()
                .iter()
                .map(|o| format!("{}:{:?}", self.texture_name(o.handle), o.role))
                .collect();
            let _ = writeln!(
                out,
                "  {} ({:?}, {:?}) reads [{}] writes [{}]",
                pass.name(),
                pass.kind(),
                pass.state(),
                reads.join(", "),
                writes.join(", ")
            );
        }
        out
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    pub fn pass_count(&self) -> usize {
        self.passes.len()
    }

    pub fn pass(&self, name: &str) -> Option<&PassNode<U>> {
        self.passes.iter().find(|p| p.name() == name)
    }

    pub fn semaphore_pool_size(&self) -> usize {
        self.semaphores.len()
    }

    pub fn semaphores(&self) -> &[SemaphoreHandle] {
        &self.semaphores
    }
}

impl<B: GraphicsBackend, U: 'static> Drop for RenderGraph<B, U> {
    fn drop(&mut self) {
        if let Err(err) = self.backend.wait_idle() {
            log::warn!("Failed to wait for device idle: {}", err);
        }
        self.clear_all_passes();
        for semaphore in self.semaphores.drain(..) {
            self.backend.destroy_semaphore(semaphore);
        }
        self.resources.destroy_all(&mut self.backend);
    }
}
