//! Deduplicating cache of bind group layouts
//!
//! Every binding set in the renderer is described by a [`LayoutDesc`], an
//! ordered list of binding kinds.  Registering a description returns a
//! [`LayoutId`]; structurally identical descriptions share one
//! [`wgpu::BindGroupLayout`], so the two ping-ponged region arrays and every
//! pipeline that reads them agree on the same layout object.
use std::collections::HashMap;

/// Sample type of a sampled texture binding
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum SampleKind {
    /// Floating-point (or normalized) texels
    Float,
    /// Unsigned integer texels
    Uint,
}

/// Kind of resource bound at one slot
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum BindingKind {
    /// Uniform buffer
    Uniform,
    /// Storage buffer, read-only in the shader
    ReadOnlyStorage,
    /// Storage buffer, read-write in the shader
    Storage,
    /// Storage texture
    StorageTexture {
        /// Shader access mode
        access: wgpu::StorageTextureAccess,
        /// Texel format
        format: wgpu::TextureFormat,
    },
    /// Sampled 2D texture
    SampledTexture(SampleKind),
    /// Filtering sampler
    Sampler,
}

impl BindingKind {
    fn ty(&self) -> wgpu::BindingType {
        let buffer = |ty| wgpu::BindingType::Buffer {
            ty,
            has_dynamic_offset: false,
            min_binding_size: None,
        };
        match *self {
            BindingKind::Uniform => buffer(wgpu::BufferBindingType::Uniform),
            BindingKind::ReadOnlyStorage => {
                buffer(wgpu::BufferBindingType::Storage { read_only: true })
            }
            BindingKind::Storage => {
                buffer(wgpu::BufferBindingType::Storage { read_only: false })
            }
            BindingKind::StorageTexture { access, format } => {
                wgpu::BindingType::StorageTexture {
                    access,
                    format,
                    view_dimension: wgpu::TextureViewDimension::D2,
                }
            }
            BindingKind::SampledTexture(kind) => wgpu::BindingType::Texture {
                sample_type: match kind {
                    SampleKind::Float => {
                        wgpu::TextureSampleType::Float { filterable: true }
                    }
                    SampleKind::Uint => wgpu::TextureSampleType::Uint,
                },
                view_dimension: wgpu::TextureViewDimension::D2,
                multisampled: false,
            },
            BindingKind::Sampler => {
                wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering)
            }
        }
    }

    /// Checks whether a resource can be bound to a slot of this kind
    fn accepts(&self, r: &BindResource) -> bool {
        match (self, r) {
            (BindingKind::Uniform, BindResource::Buffer(b)) => {
                b.usage().contains(wgpu::BufferUsages::UNIFORM)
            }
            (
                BindingKind::ReadOnlyStorage | BindingKind::Storage,
                BindResource::Buffer(b),
            ) => b.usage().contains(wgpu::BufferUsages::STORAGE),
            (
                BindingKind::StorageTexture { format, .. },
                BindResource::Texture(t),
            ) => {
                t.usage().contains(wgpu::TextureUsages::STORAGE_BINDING)
                    && t.format() == *format
            }
            (BindingKind::SampledTexture(..), BindResource::Texture(t)) => {
                t.usage().contains(wgpu::TextureUsages::TEXTURE_BINDING)
            }
            (BindingKind::Sampler, BindResource::Sampler(..)) => true,
            _ => false,
        }
    }
}

/// Ordered list of bindings, with binding indices assigned from 0
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct LayoutDesc {
    entries: Vec<(BindingKind, wgpu::ShaderStages)>,
}

impl LayoutDesc {
    /// Builds an empty description
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a description where every binding is visible to compute shaders
    pub fn compute(kinds: &[BindingKind]) -> Self {
        kinds.iter().fold(Self::new(), |d, k| {
            d.with(*k, wgpu::ShaderStages::COMPUTE)
        })
    }

    /// Appends a binding
    pub fn with(
        mut self,
        kind: BindingKind,
        visibility: wgpu::ShaderStages,
    ) -> Self {
        self.entries.push((kind, visibility));
        self
    }

    /// Returns the binding kinds, in binding order
    pub fn kinds(&self) -> impl Iterator<Item = BindingKind> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    /// Returns the number of bindings
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Checks whether the description has no bindings
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn layout_entries(&self) -> Vec<wgpu::BindGroupLayoutEntry> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, (kind, visibility))| wgpu::BindGroupLayoutEntry {
                binding: i as u32,
                visibility: *visibility,
                ty: kind.ty(),
                count: None,
            })
            .collect()
    }
}

/// Handle to a layout registered in a [`TemplateCache`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct LayoutId(usize);

/// Resource to bind at one slot of a binding set
#[derive(Copy, Clone, Debug)]
pub enum BindResource<'a> {
    /// Whole-buffer binding
    Buffer(&'a wgpu::Buffer),
    /// Default view of a texture
    Texture(&'a wgpu::Texture),
    /// Sampler
    Sampler(&'a wgpu::Sampler),
}

/// Cache of bind group layouts, keyed by structural equality
pub struct TemplateCache {
    device: wgpu::Device,
    index: HashMap<LayoutDesc, LayoutId>,
    layouts: Vec<(LayoutDesc, wgpu::BindGroupLayout)>,
}

impl TemplateCache {
    /// Builds an empty cache
    pub fn new(device: &wgpu::Device) -> Self {
        Self {
            device: device.clone(),
            index: HashMap::new(),
            layouts: vec![],
        }
    }

    /// Registers a layout description, returning its handle
    ///
    /// Registering an identical description again returns the same handle.
    pub fn register(&mut self, desc: LayoutDesc) -> LayoutId {
        if let Some(id) = self.index.get(&desc) {
            return *id;
        }
        let id = LayoutId(self.layouts.len());
        let layout = self.device.create_bind_group_layout(
            &wgpu::BindGroupLayoutDescriptor {
                label: Some(&format!("layout {}", id.0)),
                entries: &desc.layout_entries(),
            },
        );
        self.layouts.push((desc.clone(), layout));
        self.index.insert(desc, id);
        id
    }

    /// Returns the number of distinct layouts
    pub fn len(&self) -> usize {
        self.layouts.len()
    }

    /// Checks whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.layouts.is_empty()
    }

    /// Looks up a layout by handle
    ///
    /// # Panics
    /// If the handle came from a different cache
    pub fn layout(&self, id: LayoutId) -> &wgpu::BindGroupLayout {
        &self.layouts[id.0].1
    }

    /// Looks up a layout description by handle
    ///
    /// # Panics
    /// If the handle came from a different cache
    pub fn desc(&self, id: LayoutId) -> &LayoutDesc {
        &self.layouts[id.0].0
    }

    /// Builds a binding set from a layout and one resource per slot
    ///
    /// # Panics
    /// If the number of resources does not match the layout, or a resource is
    /// of the wrong kind for its slot.  Both are programming errors.
    pub fn bind(
        &self,
        id: LayoutId,
        label: &str,
        resources: &[BindResource],
    ) -> wgpu::BindGroup {
        let (desc, layout) = &self.layouts[id.0];
        assert_eq!(
            desc.len(),
            resources.len(),
            "binding set `{label}` has the wrong number of resources"
        );
        for (i, (kind, r)) in desc.kinds().zip(resources).enumerate() {
            assert!(
                kind.accepts(r),
                "binding {i} of `{label}` expects {kind:?}, got {r:?}"
            );
        }

        // Views must outlive the entries that borrow them
        let views: Vec<Option<wgpu::TextureView>> = resources
            .iter()
            .map(|r| match r {
                BindResource::Texture(t) => {
                    Some(t.create_view(&wgpu::TextureViewDescriptor::default()))
                }
                _ => None,
            })
            .collect();
        let entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .zip(&views)
            .enumerate()
            .map(|(i, (r, view))| wgpu::BindGroupEntry {
                binding: i as u32,
                resource: match (r, view) {
                    (BindResource::Buffer(b), _) => b.as_entire_binding(),
                    (BindResource::Sampler(s), _) => {
                        wgpu::BindingResource::Sampler(s)
                    }
                    (BindResource::Texture(..), Some(v)) => {
                        wgpu::BindingResource::TextureView(v)
                    }
                    (BindResource::Texture(..), None) => unreachable!(),
                },
            })
            .collect();
        self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout,
            entries: &entries,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::gpu::test_device;

    fn region_desc() -> LayoutDesc {
        LayoutDesc::compute(&[BindingKind::ReadOnlyStorage])
    }

    #[test]
    fn desc_equality() {
        assert_eq!(region_desc(), region_desc());
        assert_ne!(
            region_desc(),
            LayoutDesc::compute(&[BindingKind::Storage])
        );
        let a = LayoutDesc::new()
            .with(BindingKind::Uniform, wgpu::ShaderStages::COMPUTE);
        let b = LayoutDesc::new()
            .with(BindingKind::Uniform, wgpu::ShaderStages::FRAGMENT);
        assert_ne!(a, b);
        assert_eq!(a.len(), 1);
    }

    #[test]
    fn register_is_idempotent() {
        let Some((device, _queue)) = test_device() else {
            return;
        };
        let mut cache = TemplateCache::new(&device);
        let a = cache.register(region_desc());
        let b = cache.register(LayoutDesc::compute(&[BindingKind::Storage]));
        let c = cache.register(region_desc());
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.desc(a), &region_desc());
    }

    #[test]
    fn bind_checks_resources() {
        let Some((device, _queue)) = test_device() else {
            return;
        };
        let mut cache = TemplateCache::new(&device);
        let id = cache.register(region_desc());
        let buf = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: 64,
            usage: wgpu::BufferUsages::STORAGE,
            mapped_at_creation: false,
        });
        cache.bind(id, "ok", &[BindResource::Buffer(&buf)]);

        let arity = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.bind(id, "arity", &[]);
        }));
        assert!(arity.is_err());

        let uniform = device.create_buffer(&wgpu::BufferDescriptor {
            label: None,
            size: 64,
            usage: wgpu::BufferUsages::UNIFORM,
            mapped_at_creation: false,
        });
        let kind = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            cache.bind(id, "kind", &[BindResource::Buffer(&uniform)]);
        }));
        assert!(kind.is_err());
    }
}
