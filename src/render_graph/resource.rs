//! Named GPU textures owned by the render graph

use crate::backend::traits::*;
use crate::backend::types::*;
use std::collections::HashMap;

/// Handle to a render graph texture. Encodes the resource's index in its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u32);

impl TextureHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// A lazily created GPU texture with a cache of subresource views
#[derive(Debug)]
pub struct ResourceNode {
    name: String,
    index: usize,
    desc: ImageDescriptor,
    image: Option<ImageHandle>,
    imported: bool,
    views: HashMap<Subresource, ImageViewHandle>,
}

impl ResourceNode {
    fn new(name: &str, index: usize, desc: ImageDescriptor) -> Self {
        Self {
            name: name.to_string(),
            index,
            desc,
            image: None,
            imported: false,
            views: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> TextureHandle {
        TextureHandle(self.index as u32)
    }

    pub fn descriptor(&self) -> &ImageDescriptor {
        &self.desc
    }

    pub fn image(&self) -> Option<ImageHandle> {
        self.image
    }

    pub fn is_created(&self) -> bool {
        self.image.is_some()
    }

    /// Imported images belong to the caller and are never destroyed by the graph.
    pub fn is_imported(&self) -> bool {
        self.imported
    }

    /// Number of distinct views created so far
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Allocate the backing image. Does nothing once the image exists.
    pub fn create<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> BackendResult<()> {
        if self.image.is_some() {
            return Ok(());
        }
        let mut desc = self.desc.clone();
        if desc.label.is_none() {
            desc.label = Some(self.name.clone());
        }
        self.image = Some(backend.create_image(&desc)?);
        log::debug!("Created render graph texture '{}'", self.name);
        Ok(())
    }

    /// View dimensionality for `subresource`, inferred from the image kind.
    ///
    /// Array kinds always get array views so shaders see the type they declare.
    /// Partial cube ranges fall back to 2D (array) views.
    pub fn view_type(&self, subresource: &Subresource) -> ImageViewType {
        let layers = subresource.layer_count;
        match self.desc.kind {
            ImageKind::D2 if layers > 1 => ImageViewType::D2Array,
            ImageKind::D2 => ImageViewType::D2,
            ImageKind::D2Array => ImageViewType::D2Array,
            ImageKind::Cube if layers == 6 => ImageViewType::Cube,
            ImageKind::Cube if layers == 1 => ImageViewType::D2,
            ImageKind::Cube => ImageViewType::D2Array,
            ImageKind::CubeArray if layers % 6 == 0 => ImageViewType::CubeArray,
            ImageKind::CubeArray => ImageViewType::D2Array,
            ImageKind::D3 => ImageViewType::D3,
        }
    }

    /// Returns the memoized view of `subresource`, creating it on first request.
    pub fn image_view<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        subresource: Subresource,
    ) -> BackendResult<ImageViewHandle> {
        if let Some(view) = self.views.get(&subresource) {
            return Ok(*view);
        }

        let image = match self.image {
            Some(image) => image,
            None => panic!(
                "Texture '{}' is viewed before it was created; compile the graph first",
                self.name
            ),
        };
        assert!(
            subresource.layer_count > 0 && subresource.level_count > 0,
            "Texture '{}': empty subresource {:?}",
            self.name,
            subresource
        );
        let fits = |base: u32, count: u32, limit: u32| base.checked_add(count).is_some_and(|end| end <= limit);
        assert!(
            fits(subresource.base_layer, subresource.layer_count, self.desc.array_layers)
                && fits(subresource.base_level, subresource.level_count, self.desc.mip_levels),
            "Texture '{}': subresource {:?} exceeds {} layers / {} levels",
            self.name,
            subresource,
            self.desc.array_layers,
            self.desc.mip_levels
        );

        let view = backend.create_image_view(
            image,
            &ImageViewDescriptor {
                view_type: self.view_type(&subresource),
                format: self.desc.format,
                subresource,
            },
        )?;
        self.views.insert(subresource, view);
        Ok(view)
    }

    pub(crate) fn destroy<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, view) in self.views.drain() {
            backend.destroy_image_view(view);
        }
        if let Some(image) = self.image.take() {
            if !self.imported {
                backend.destroy_image(image);
            }
        }
    }
}

/// Owns every texture of a render graph and resolves handles to nodes and views
#[derive(Debug, Default)]
pub struct ResourceManager {
    nodes: Vec<ResourceNode>,
    by_name: HashMap<String, TextureHandle>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a texture. A second request for an existing name returns the
    /// first handle and ignores `desc`.
    pub fn create_texture(&mut self, name: &str, desc: ImageDescriptor) -> TextureHandle {
        if let Some(handle) = self.by_name.get(name) {
            log::warn!(
                "Texture '{}' already exists, returning the existing handle",
                name
            );
            return *handle;
        }
        let handle = TextureHandle(self.nodes.len() as u32);
        self.nodes.push(ResourceNode::new(name, handle.index(), desc));
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    /// Register an image created outside the graph, e.g. a presentable image.
    pub fn import_texture(
        &mut self,
        name: &str,
        image: ImageHandle,
        desc: ImageDescriptor,
    ) -> TextureHandle {
        if let Some(handle) = self.by_name.get(name) {
            log::warn!(
                "Texture '{}' already exists, ignoring the imported image",
                name
            );
            return *handle;
        }
        let handle = TextureHandle(self.nodes.len() as u32);
        let mut node = ResourceNode::new(name, handle.index(), desc);
        node.image = Some(image);
        node.imported = true;
        self.nodes.push(node);
        self.by_name.insert(name.to_string(), handle);
        handle
    }

    /// Handle for `name`. Panics if no such texture was registered.
    pub fn handle(&self, name: &str) -> TextureHandle {
        match self.by_name.get(name) {
            Some(handle) => *handle,
            None => panic!("Unknown render graph texture '{}'", name),
        }
    }

    pub fn find(&self, name: &str) -> Option<TextureHandle> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, handle: TextureHandle) -> bool {
        handle.index() < self.nodes.len()
    }

    pub fn node(&self, handle: TextureHandle) -> &ResourceNode {
        assert!(
            self.contains(handle),
            "Texture handle {} out of range ({} textures)",
            handle.index(),
            self.nodes.len()
        );
        &self.nodes[handle.index()]
    }

    pub fn node_mut(&mut self, handle: TextureHandle) -> &mut ResourceNode {
        assert!(
            self.contains(handle),
            "Texture handle {} out of range ({} textures)",
            handle.index(),
            self.nodes.len()
        );
        &mut self.nodes[handle.index()]
    }

    pub fn image_view<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        handle: TextureHandle,
        subresource: Subresource,
    ) -> BackendResult<ImageViewHandle> {
        self.node_mut(handle).image_view(backend, subresource)
    }

    /// Create every texture that does not exist yet.
    pub fn create_all<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) -> BackendResult<()> {
        for node in &mut self.nodes {
            node.create(backend)?;
        }
        Ok(())
    }

    pub(crate) fn destroy_all<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        for node in &mut self.nodes {
            node.destroy(backend);
        }
        self.nodes.clear();
        self.by_name.clear();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};

    fn color_target(width: u32, height: u32) -> ImageDescriptor {
        ImageDescriptor::new_2d(
            width,
            height,
            TextureFormat::Rgba8Unorm,
            TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING,
        )
    }

    #[test]
    fn test_duplicate_name_returns_first_handle() {
        let mut resources = ResourceManager::new();
        let first = resources.create_texture("A", color_target(64, 64));
        let second = resources.create_texture("A", color_target(128, 32));
        assert_eq!(first, second);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources.node(first).descriptor().width, 64);
    }

    #[test]
    fn test_create_is_idempotent() {
        let mut backend = DummyBackend::new();
        let mut resources = ResourceManager::new();
        let handle = resources.create_texture("A", color_target(16, 16));
        resources.create_all(&mut backend).unwrap();
        let image = resources.node(handle).image();
        resources.create_all(&mut backend).unwrap();
        assert_eq!(resources.node(handle).image(), image);
        assert_eq!(backend.created_count(ObjectKind::Image), 1);
    }

    #[test]
    fn test_views_are_memoized() {
        let mut backend = DummyBackend::new();
        let mut resources = ResourceManager::new();
        let handle = resources.create_texture("A", color_target(16, 16).with_mip_levels(3));
        resources.create_all(&mut backend).unwrap();

        let a = resources
            .image_view(&mut backend, handle, Subresource::default())
            .unwrap();
        let b = resources
            .image_view(&mut backend, handle, Subresource::default())
            .unwrap();
        let c = resources
            .image_view(&mut backend, handle, Subresource::level(2))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(resources.node(handle).view_count(), 2);
        assert_eq!(backend.created_count(ObjectKind::ImageView), 2);
    }

    #[test]
    fn test_view_type_inference() {
        let mut resources = ResourceManager::new();
        let usage = TextureUsage::TEXTURE_BINDING;
        let cube = resources.create_texture("cube", ImageDescriptor::cube(32, TextureFormat::Rgba16Float, usage));
        let cubes = resources.create_texture(
            "cubes",
            ImageDescriptor::cube(32, TextureFormat::Rgba16Float, usage).with_array_layers(2),
        );
        let array = resources.create_texture("array", color_target(8, 8).with_array_layers(4));
        let volume = resources.create_texture(
            "volume",
            ImageDescriptor::new_3d(8, 8, 8, TextureFormat::R32Float, usage),
        );

        let node = resources.node(cube);
        assert_eq!(node.view_type(&Subresource::new(0, 6, 0, 1)), ImageViewType::Cube);
        assert_eq!(node.view_type(&Subresource::layer(3)), ImageViewType::D2);
        assert_eq!(node.view_type(&Subresource::new(0, 3, 0, 1)), ImageViewType::D2Array);

        let node = resources.node(cubes);
        assert_eq!(node.view_type(&Subresource::new(0, 12, 0, 1)), ImageViewType::CubeArray);
        assert_eq!(node.view_type(&Subresource::new(6, 6, 0, 1)), ImageViewType::CubeArray);
        assert_eq!(node.view_type(&Subresource::layer(7)), ImageViewType::D2Array);

        // Array images keep array views even for a single layer.
        let node = resources.node(array);
        assert_eq!(node.view_type(&Subresource::new(0, 4, 0, 1)), ImageViewType::D2Array);
        assert_eq!(node.view_type(&Subresource::layer(1)), ImageViewType::D2Array);

        let plain = resources.create_texture("plain", color_target(8, 8));
        assert_eq!(resources.node(plain).view_type(&Subresource::default()), ImageViewType::D2);

        assert_eq!(
            resources.node(volume).view_type(&Subresource::default()),
            ImageViewType::D3
        );
    }

    #[test]
    fn test_imported_texture_is_not_destroyed() {
        let mut backend = DummyBackend::new();
        let image = backend.create_image(&color_target(8, 8)).unwrap();

        let mut resources = ResourceManager::new();
        let handle = resources.import_texture("backbuffer", image, color_target(8, 8));
        assert!(resources.node(handle).is_created());
        resources.create_all(&mut backend).unwrap();
        assert_eq!(backend.created_count(ObjectKind::Image), 1);

        resources
            .image_view(&mut backend, handle, Subresource::default())
            .unwrap();
        resources.destroy_all(&mut backend);
        assert_eq!(backend.live_count(ObjectKind::Image), 1);
        assert_eq!(backend.live_count(ObjectKind::ImageView), 0);
    }

    #[test]
    #[should_panic(expected = "Unknown render graph texture")]
    fn test_unknown_name_panics() {
        let resources = ResourceManager::new();
        resources.handle("missing");
    }

    #[test]
    #[should_panic(expected = "exceeds 1 layers / 3 levels")]
    fn test_wrapping_subresource_range_panics() {
        let mut backend = DummyBackend::new();
        let mut resources = ResourceManager::new();
        let handle = resources.create_texture("A", color_target(16, 16).with_mip_levels(3));
        resources.create_all(&mut backend).unwrap();
        let _ = resources.image_view(&mut backend, handle, Subresource::new(0, 1, u32::MAX, 2));
    }

    #[test]
    #[should_panic(expected = "before it was created")]
    fn test_view_before_create_panics() {
        let mut backend = DummyBackend::new();
        let mut resources = ResourceManager::new();
        let handle = resources.create_texture("A", color_target(8, 8));
        let _ = resources.image_view(&mut backend, handle, Subresource::default());
    }
}
