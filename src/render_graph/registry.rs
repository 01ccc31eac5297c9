//! Execute-time access to a pass's compiled objects

use crate::backend::traits::*;
use crate::backend::types::*;
use crate::render_graph::pass::CompiledPass;
use crate::render_graph::resource::TextureHandle;

/// Handed to a pass while it records or decides whether it runs this frame.
pub struct Registry<'a, U> {
    pass_name: &'a str,
    kind: PassKind,
    compiled: &'a CompiledPass,
    user_data: &'a U,
}

impl<'a, U> Registry<'a, U> {
    pub(crate) fn new(
        pass_name: &'a str,
        kind: PassKind,
        compiled: &'a CompiledPass,
        user_data: &'a U,
    ) -> Self {
        Self {
            pass_name,
            kind,
            compiled,
            user_data,
        }
    }

    pub fn pass_name(&self) -> &'a str {
        self.pass_name
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    /// Per-frame data given to `execute` / `execute_alone`
    pub fn user_data(&self) -> &'a U {
        self.user_data
    }

    /// Descriptor set holding every declared input, one binding each in declaration order.
    pub fn input_descriptor_set(&self) -> DescriptorSetHandle {
        match self.compiled.input_set {
            Some(set) => set,
            None => panic!("Pass '{}' declared no inputs", self.pass_name),
        }
    }

    pub fn has_input_descriptor_set(&self) -> bool {
        self.compiled.input_set.is_some()
    }

    pub fn pipeline(&self, index: usize) -> PipelineHandle {
        assert!(
            index < self.compiled.pipelines.len(),
            "Pass '{}' has {} pipelines, requested index {}",
            self.pass_name,
            self.compiled.pipelines.len(),
            index
        );
        self.compiled.pipelines[index]
    }

    pub fn pipeline_count(&self) -> usize {
        self.compiled.pipelines.len()
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        assert!(
            self.kind == PassKind::Graphics,
            "Compute pass '{}' has no framebuffer",
            self.pass_name
        );
        match self.compiled.framebuffer {
            Some(framebuffer) => framebuffer,
            None => panic!("Pass '{}' has no framebuffer", self.pass_name),
        }
    }

    /// `(width, height, layers)` of the framebuffer.
    pub fn framebuffer_size(&self) -> (u32, u32, u32) {
        match self.compiled.framebuffer_size {
            Some(size) => (size.width, size.height, size.layers),
            None => panic!("Pass '{}' has no framebuffer", self.pass_name),
        }
    }

    /// Viewport covering the whole framebuffer
    pub fn viewport(&self) -> Viewport {
        let (width, height, _) = self.framebuffer_size();
        Viewport::from_size(width, height)
    }

    pub fn scissor(&self) -> ScissorRect {
        let (width, height, _) = self.framebuffer_size();
        ScissorRect::from_size(width, height)
    }

    /// View of `subresource` of a texture this pass declared as input or output.
    pub fn image_view(&self, handle: TextureHandle, subresource: Subresource) -> Option<ImageViewHandle> {
        let view = self
            .compiled
            .views
            .iter()
            .find(|(h, range, _)| *h == handle && *range == subresource)
            .map(|(_, _, view)| *view);
        if view.is_none() {
            log::warn!(
                "Pass '{}' looked up texture {} {:?} which it did not declare",
                self.pass_name,
                handle.index(),
                subresource
            );
        }
        view
    }
}
