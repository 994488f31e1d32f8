//! Per-renderer GPU state: tape, transform, and output image
use crate::{
    Error,
    config::RendererConfig,
    gpu::{
        template::{
            BindResource, BindingKind, LayoutDesc, LayoutId, SampleKind,
            TemplateCache,
        },
        util::new_buffer,
    },
    tape::{HEADER_SIZE, Instruction, Tape},
    types::SurfaceKind,
};
use log::debug;
use nalgebra::{Matrix3, Matrix4, Point2, Point3};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Homogeneous screen-to-evaluation transform
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Transform {
    /// 3×3 matrix for 2D surfaces
    TwoD(Matrix3<f32>),
    /// 4×4 matrix for 3D surfaces
    ThreeD(Matrix4<f32>),
}

impl Transform {
    /// Returns the identity transform for a surface kind
    pub fn identity(kind: SurfaceKind) -> Self {
        match kind {
            SurfaceKind::TwoD => Transform::TwoD(Matrix3::identity()),
            SurfaceKind::ThreeD => Transform::ThreeD(Matrix4::identity()),
        }
    }

    /// Returns the surface kind that this transform applies to
    pub fn kind(&self) -> SurfaceKind {
        match self {
            Transform::TwoD(..) => SurfaceKind::TwoD,
            Transform::ThreeD(..) => SurfaceKind::ThreeD,
        }
    }

    /// Returns the inverse transform, or `None` if the matrix is singular
    pub fn try_inverse(&self) -> Option<Self> {
        match self {
            Transform::TwoD(m) => m.try_inverse().map(Transform::TwoD),
            Transform::ThreeD(m) => m.try_inverse().map(Transform::ThreeD),
        }
    }

    /// Checks whether every matrix element is finite
    pub fn is_finite(&self) -> bool {
        match self {
            Transform::TwoD(m) => m.iter().all(|v| v.is_finite()),
            Transform::ThreeD(m) => m.iter().all(|v| v.is_finite()),
        }
    }

    /// Applies the transform to a point, with a perspective divide
    ///
    /// For 2D transforms, the input Z coordinate is ignored and the output Z
    /// coordinate is 0.
    pub fn transform_point(&self, p: &Point3<f32>) -> Point3<f32> {
        match self {
            Transform::TwoD(m) => {
                let q = m.transform_point(&Point2::new(p.x, p.y));
                Point3::new(q.x, q.y, 0.0)
            }
            Transform::ThreeD(m) => m.transform_point(p),
        }
    }

    /// Returns the matrix in column-major order, with each column padded to 4
    /// elements and unused columns left as zero
    fn padded(&self) -> [f32; 16] {
        let mut out = [0.0; 16];
        match self {
            Transform::TwoD(m) => {
                for c in 0..3 {
                    for r in 0..3 {
                        out[c * 4 + r] = m[(r, c)];
                    }
                }
            }
            Transform::ThreeD(m) => out.copy_from_slice(m.as_slice()),
        }
        out
    }
}

/// Doppelganger of the WGSL `struct Transform`
///
/// For 2D surfaces, each 3×3 matrix sits in the upper-left corner of a
/// `mat4x4f`, so the same layout serves both kinds.
#[derive(Debug, IntoBytes, Immutable, FromBytes, KnownLayout)]
#[repr(C)]
struct TransformData {
    /// Screen-to-evaluation matrix
    to_eval: [f32; 16],

    /// Evaluation-to-screen matrix
    to_screen: [f32; 16],

    /// Image size, in pixels
    size: [u32; 2],

    _padding: [u32; 2],
}

static_assertions::const_assert_eq!(
    std::mem::size_of::<TransformData>(),
    144
);

/// Resource counters, for checking that resizes release what they replace
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceStats {
    /// Number of output textures created
    pub textures_created: usize,
    /// Number of output textures destroyed
    pub textures_destroyed: usize,
}

/// GPU state shared by every pass of a frame
///
/// This owns the tape buffer, the transform buffer and the output texture
/// (plus the depth key buffer for 3D surfaces), along with the compute and
/// render binding sets that reference them.
pub struct EvaluationState {
    device: wgpu::Device,
    queue: wgpu::Queue,
    kind: SurfaceKind,
    max_instructions: u32,

    tape: wgpu::Buffer,
    tape_len: Option<u32>,

    transform: Transform,
    transform_buf: wgpu::Buffer,

    size: (u32, u32),
    output: wgpu::Texture,
    depth: Option<wgpu::Buffer>,

    compute_layout: LayoutId,
    render_layout: LayoutId,
    compute_bind_group: wgpu::BindGroup,
    render_bind_group: wgpu::BindGroup,

    stats: ResourceStats,
}

impl EvaluationState {
    /// Builds GPU state for a (validated) configuration
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        cache: &mut TemplateCache,
        config: &RendererConfig,
    ) -> Self {
        let kind = config.surface;
        let tape = new_buffer(
            device,
            "tape",
            HEADER_SIZE as u64
                + config.max_instructions as u64
                    * std::mem::size_of::<Instruction>() as u64,
            wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
        );
        let transform_buf = new_buffer(
            device,
            "transform",
            std::mem::size_of::<TransformData>() as u64,
            wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        );

        let compute_layout = cache.register(Self::compute_desc(kind));
        let render_layout = cache.register(Self::render_desc(kind));

        let size = (config.width, config.height);
        let output = Self::new_output(device, kind, size);
        let depth = Self::new_depth(device, kind, size);
        let compute_bind_group = Self::build_compute_bind_group(
            cache,
            compute_layout,
            &tape,
            &output,
            &transform_buf,
            depth.as_ref(),
        );
        let render_bind_group = cache.bind(
            render_layout,
            "present",
            &[BindResource::Texture(&output)],
        );

        let out = Self {
            device: device.clone(),
            queue: queue.clone(),
            kind,
            max_instructions: config.max_instructions,
            tape,
            tape_len: None,
            transform: Transform::identity(kind),
            transform_buf,
            size,
            output,
            depth,
            compute_layout,
            render_layout,
            compute_bind_group,
            render_bind_group,
            stats: ResourceStats {
                textures_created: 1,
                textures_destroyed: 0,
            },
        };
        out.write_transform();
        out
    }

    /// Layout of the compute binding set (group 0 of every subdivision pass)
    fn compute_desc(kind: SurfaceKind) -> LayoutDesc {
        let mut kinds = vec![
            BindingKind::ReadOnlyStorage,
            BindingKind::StorageTexture {
                access: wgpu::StorageTextureAccess::WriteOnly,
                format: Self::output_format(kind),
            },
            BindingKind::Uniform,
        ];
        if kind == SurfaceKind::ThreeD {
            kinds.push(BindingKind::Storage);
        }
        LayoutDesc::compute(&kinds)
    }

    /// Layout of the render binding set (group 0 of the presentation pass)
    fn render_desc(kind: SurfaceKind) -> LayoutDesc {
        let sample = match kind {
            SurfaceKind::TwoD => SampleKind::Float,
            SurfaceKind::ThreeD => SampleKind::Uint,
        };
        LayoutDesc::new().with(
            BindingKind::SampledTexture(sample),
            wgpu::ShaderStages::FRAGMENT,
        )
    }

    /// Texel format of the output texture
    pub fn output_format(kind: SurfaceKind) -> wgpu::TextureFormat {
        match kind {
            SurfaceKind::TwoD => wgpu::TextureFormat::Rgba8Unorm,
            SurfaceKind::ThreeD => wgpu::TextureFormat::R32Uint,
        }
    }

    fn new_output(
        device: &wgpu::Device,
        kind: SurfaceKind,
        (width, height): (u32, u32),
    ) -> wgpu::Texture {
        let mut usage = wgpu::TextureUsages::STORAGE_BINDING
            | wgpu::TextureUsages::TEXTURE_BINDING
            | wgpu::TextureUsages::COPY_SRC;
        if kind == SurfaceKind::TwoD {
            // Cleared with a render pass at the start of each frame
            usage |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        device.create_texture(&wgpu::TextureDescriptor {
            label: Some("output"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::output_format(kind),
            usage,
            view_formats: &[],
        })
    }

    fn new_depth(
        device: &wgpu::Device,
        kind: SurfaceKind,
        (width, height): (u32, u32),
    ) -> Option<wgpu::Buffer> {
        (kind == SurfaceKind::ThreeD).then(|| {
            new_buffer(
                device,
                "depth keys",
                width as u64 * height as u64 * 4,
                wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
            )
        })
    }

    fn build_compute_bind_group(
        cache: &TemplateCache,
        layout: LayoutId,
        tape: &wgpu::Buffer,
        output: &wgpu::Texture,
        transform: &wgpu::Buffer,
        depth: Option<&wgpu::Buffer>,
    ) -> wgpu::BindGroup {
        let mut resources = vec![
            BindResource::Buffer(tape),
            BindResource::Texture(output),
            BindResource::Buffer(transform),
        ];
        resources.extend(depth.map(BindResource::Buffer));
        cache.bind(layout, "evaluation state", &resources)
    }

    /// Uploads a tape, replacing the previous one
    ///
    /// # Panics
    /// If the tape is longer than the configured maximum instruction count.
    /// [`Renderer::set_tape`](crate::gpu::Renderer::set_tape) checks this and
    /// returns an error instead.
    pub fn set_tape(&mut self, tape: &Tape) {
        assert!(
            tape.len() <= self.max_instructions as usize,
            "tape has {} instructions, but the buffer holds {}",
            tape.len(),
            self.max_instructions
        );
        debug!("uploading tape with {} instructions", tape.len());
        self.queue.write_buffer(&self.tape, 0, &tape.to_bytes());
        self.tape_len = Some(tape.len() as u32);
    }

    /// Returns the length of the current tape, or `None` if none is set
    pub fn tape_len(&self) -> Option<u32> {
        self.tape_len
    }

    /// Returns the tape buffer
    pub fn tape_buffer(&self) -> &wgpu::Buffer {
        &self.tape
    }

    /// Returns the maximum tape length
    pub fn max_instructions(&self) -> u32 {
        self.max_instructions
    }

    /// Sets the screen-to-evaluation transform
    ///
    /// The inverse is computed here and uploaded alongside it.
    pub fn set_transform(
        &mut self,
        screen_to_eval: Transform,
    ) -> Result<(), Error> {
        if screen_to_eval.kind() != self.kind {
            return Err(Error::WrongTransform {
                expected: self.kind.dims(),
            });
        }
        // `try_inverse` happily inverts a matrix full of NaNs
        if !screen_to_eval.is_finite()
            || !screen_to_eval.try_inverse().is_some_and(|t| t.is_finite())
        {
            return Err(Error::SingularTransform);
        }
        self.transform = screen_to_eval;
        self.write_transform();
        Ok(())
    }

    /// Returns the current screen-to-evaluation transform
    pub fn transform(&self) -> Transform {
        self.transform
    }

    fn write_transform(&self) {
        // Checked for invertibility in `set_transform`; the identity used at
        // construction is trivially invertible
        let to_screen = self.transform.try_inverse().unwrap_or(self.transform);
        let data = TransformData {
            to_eval: self.transform.padded(),
            to_screen: to_screen.padded(),
            size: [self.size.0, self.size.1],
            _padding: [0; 2],
        };
        self.queue
            .write_buffer(&self.transform_buf, 0, data.as_bytes());
    }

    /// Recreates the output image at a new size
    ///
    /// The old texture (and depth buffer) is always destroyed and replaced,
    /// even if the size is unchanged, and every binding set that referenced it
    /// is rebuilt.
    pub fn resize(&mut self, cache: &TemplateCache, width: u32, height: u32) {
        debug!("resizing output to {width}×{height}");
        self.output.destroy();
        self.stats.textures_destroyed += 1;
        if let Some(d) = &self.depth {
            d.destroy();
        }

        self.size = (width, height);
        self.output = Self::new_output(&self.device, self.kind, self.size);
        self.stats.textures_created += 1;
        self.depth = Self::new_depth(&self.device, self.kind, self.size);

        self.compute_bind_group = Self::build_compute_bind_group(
            cache,
            self.compute_layout,
            &self.tape,
            &self.output,
            &self.transform_buf,
            self.depth.as_ref(),
        );
        self.render_bind_group = cache.bind(
            self.render_layout,
            "present",
            &[BindResource::Texture(&self.output)],
        );
        self.write_transform();
    }

    /// Records commands to reset the output image for a new frame
    ///
    /// 2D images are cleared to transparent black; 3D depth keys are cleared
    /// to zero (empty).
    pub fn clear_output(&self, encoder: &mut wgpu::CommandEncoder) {
        match &self.depth {
            Some(depth) => encoder.clear_buffer(depth, 0, None),
            None => {
                let view = self
                    .output
                    .create_view(&wgpu::TextureViewDescriptor::default());
                encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("clear output"),
                    color_attachments: &[Some(
                        wgpu::RenderPassColorAttachment {
                            view: &view,
                            depth_slice: None,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load: wgpu::LoadOp::Clear(
                                    wgpu::Color::TRANSPARENT,
                                ),
                                store: wgpu::StoreOp::Store,
                            },
                        },
                    )],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
            }
        }
    }

    /// Returns the surface kind
    pub fn kind(&self) -> SurfaceKind {
        self.kind
    }

    /// Returns the output size, in pixels
    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    /// Returns the output texture
    pub fn output(&self) -> &wgpu::Texture {
        &self.output
    }

    /// Returns the depth key buffer (3D only)
    pub fn depth_buffer(&self) -> Option<&wgpu::Buffer> {
        self.depth.as_ref()
    }

    /// Returns the compute binding set
    pub fn compute_bind_group(&self) -> &wgpu::BindGroup {
        &self.compute_bind_group
    }

    /// Returns the render binding set
    pub fn render_bind_group(&self) -> &wgpu::BindGroup {
        &self.render_bind_group
    }

    /// Layout handle of the compute binding set
    pub fn compute_layout(&self) -> LayoutId {
        self.compute_layout
    }

    /// Layout handle of the render binding set
    pub fn render_layout(&self) -> LayoutId {
        self.render_layout
    }

    /// Returns resource counters
    pub fn stats(&self) -> ResourceStats {
        self.stats
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        gpu::{test_device, util::read_buffer},
        tape::MAX_INSTS,
    };

    type Fixture = (wgpu::Device, wgpu::Queue, TemplateCache, EvaluationState);

    fn build(kind: SurfaceKind) -> Option<Fixture> {
        let (device, queue) = test_device()?;
        let mut cache = TemplateCache::new(&device);
        let config = RendererConfig {
            surface: kind,
            width: 64,
            height: 32,
            ..RendererConfig::default()
        };
        let state = EvaluationState::new(&device, &queue, &mut cache, &config);
        Some((device, queue, cache, state))
    }

    #[test]
    fn padded_layout() {
        let m = Matrix3::new(1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0);
        let p = Transform::TwoD(m).padded();
        assert_eq!(
            p,
            [
                1.0, 4.0, 7.0, 0.0, 2.0, 5.0, 8.0, 0.0, 3.0, 6.0, 9.0, 0.0,
                0.0, 0.0, 0.0, 0.0
            ]
        );
        let m = Matrix4::from_fn(|r, c| (r * 4 + c) as f32);
        let p = Transform::ThreeD(m).padded();
        assert_eq!(p[1], 4.0);
        assert_eq!(p[4], 1.0);
    }

    #[test]
    fn tape_round_trip() {
        let Some((device, queue, _cache, mut state)) =
            build(SurfaceKind::TwoD)
        else {
            return;
        };
        assert_eq!(state.tape_len(), None);
        for n in [0, 1, MAX_INSTS as usize] {
            let inst: Vec<Instruction> = (0..n)
                .map(|i| Instruction::constant(0, i as f32))
                .collect();
            let tape = Tape::new(inst).unwrap();
            state.set_tape(&tape);
            assert_eq!(state.tape_len(), Some(n as u32));

            let words: Vec<u32> =
                read_buffer(&device, &queue, state.tape_buffer()).unwrap();
            assert_eq!(words[0], n as u32);
            let bytes = tape.to_bytes();
            let got: &[u8] = words.as_bytes();
            assert_eq!(&got[..bytes.len()], bytes.as_slice());
        }
    }

    #[test]
    fn tape_too_long() {
        let Some((_device, _queue, _cache, mut state)) =
            build(SurfaceKind::TwoD)
        else {
            return;
        };
        let n = MAX_INSTS as usize + 1;
        let tape = Tape::new(vec![Instruction::constant(0, 1.0); n]).unwrap();
        let r = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            state.set_tape(&tape)
        }));
        assert!(r.is_err());
        assert_eq!(state.tape_len(), None);
    }

    #[test]
    fn transform_checks() {
        let Some((_device, _queue, _cache, mut state)) =
            build(SurfaceKind::TwoD)
        else {
            return;
        };
        assert!(matches!(
            state.set_transform(Transform::identity(SurfaceKind::ThreeD)),
            Err(Error::WrongTransform { expected: 2 })
        ));
        assert!(matches!(
            state.set_transform(Transform::TwoD(Matrix3::zeros())),
            Err(Error::SingularTransform)
        ));
        for bad in [f32::NAN, f32::INFINITY] {
            let t = Transform::TwoD(Matrix3::new_scaling(bad));
            assert!(matches!(
                state.set_transform(t),
                Err(Error::SingularTransform)
            ));
        }
        assert_eq!(
            state.transform(),
            Transform::identity(SurfaceKind::TwoD),
            "rejected transforms leave the previous one in place"
        );
        let m = Matrix3::new_scaling(2.0);
        state.set_transform(Transform::TwoD(m)).unwrap();
        assert_eq!(state.transform(), Transform::TwoD(m));
    }

    #[test]
    fn resize_is_idempotent() {
        for kind in [SurfaceKind::TwoD, SurfaceKind::ThreeD] {
            let Some((_device, _queue, cache, mut state)) = build(kind) else {
                return;
            };
            for _ in 0..3 {
                state.resize(&cache, 128, 96);
            }
            assert_eq!(state.size(), (128, 96));
            assert_eq!(state.output().width(), 128);
            assert_eq!(state.output().height(), 96);
            let stats = state.stats();
            assert_eq!(stats.textures_created, 4);
            assert_eq!(
                stats.textures_created - stats.textures_destroyed,
                1,
                "exactly one live output texture"
            );
            if kind == SurfaceKind::ThreeD {
                assert_eq!(state.depth_buffer().unwrap().size(), 128 * 96 * 4);
            }
        }
    }
}
