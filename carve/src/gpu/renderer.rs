//! Frame orchestration
use crate::{
    Error,
    config::RendererConfig,
    gpu::{
        pipeline::{FrameStage, SubdivisionPipeline},
        present::PresentationPass,
        regions::RegionArraySet,
        state::{EvaluationState, ResourceStats, Transform},
        template::TemplateCache,
        util::{read_buffer, read_texture},
    },
    tape::Tape,
    types::{Region, SurfaceKind},
    view::{Camera3, View2},
};
use log::{debug, error, info, warn};
use nalgebra::Point3;
use std::sync::{Arc, Mutex};

/// Result of a frame request
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was submitted to the GPU
    Rendered,
    /// No tape has been set, so nothing was done
    Skipped,
}

/// Viewport, by surface kind
#[derive(Copy, Clone, Debug)]
enum Viewport {
    TwoD(View2),
    ThreeD(Camera3),
}

/// Computes the root region covering a viewport
///
/// For 2D surfaces, this is the image rectangle mapped into evaluation space.
/// For 3D surfaces, it is the bounding box of the view volume, clamped to
/// `bounds`; if the two don't overlap, `bounds` is used as-is.  A transform
/// that maps a corner to a non-finite point also falls back to `bounds`.
pub fn viewport_root(
    screen_to_eval: &Transform,
    width: u32,
    height: u32,
    bounds: &Region,
) -> Region {
    let (w, h) = (width as f32, height as f32);
    let depths: &[f32] = match screen_to_eval.kind() {
        SurfaceKind::TwoD => &[0.0],
        SurfaceKind::ThreeD => &[0.0, 1.0],
    };
    let mut lo = Point3::new(f32::INFINITY, f32::INFINITY, f32::INFINITY);
    let mut hi = -lo;
    for &x in &[0.0, w] {
        for &y in &[0.0, h] {
            for &z in depths {
                let p = screen_to_eval.transform_point(&Point3::new(x, y, z));
                lo = lo.inf(&p);
                hi = hi.sup(&p);
            }
        }
    }
    if !lo.iter().chain(hi.iter()).all(|v| v.is_finite()) {
        return *bounds;
    }
    let region = Region::new([lo.x, hi.x], [lo.y, hi.y], [lo.z, hi.z]);
    match screen_to_eval.kind() {
        SurfaceKind::TwoD => region,
        SurfaceKind::ThreeD => region.intersect(bounds).unwrap_or(*bounds),
    }
}

/// GPU renderer for implicit surfaces
///
/// Each frame seeds generation 0 with a root region, runs one subdivision
/// pass per generation, and (optionally) draws the result onto a target
/// texture.  All of this is recorded into a single command buffer.
pub struct Renderer {
    device: wgpu::Device,
    queue: wgpu::Queue,
    config: RendererConfig,

    cache: TemplateCache,
    state: EvaluationState,
    regions: RegionArraySet,
    pipeline: SubdivisionPipeline,
    present: PresentationPass,

    viewport: Viewport,
    root_override: Option<Region>,
    lost: Arc<Mutex<Option<String>>>,
}

impl Renderer {
    /// Requests a device from the default adapter and builds a renderer
    pub async fn init(config: RendererConfig) -> Result<Self, Error> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|_| Error::NoAdapter)?;
        info!("using adapter {}", adapter.get_info().name);
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("carve"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await?;
        Self::new(device, queue, config)
    }

    /// Builds a renderer on an existing device
    ///
    /// The configuration is validated against the device's limits before any
    /// GPU resources are created.
    pub fn new(
        device: wgpu::Device,
        queue: wgpu::Queue,
        config: RendererConfig,
    ) -> Result<Self, Error> {
        config.validate(&device.limits())?;
        info!(
            "building {}D renderer: split {}, {} generations, {}×{}",
            config.surface.dims(),
            config.split,
            config.generations,
            config.width,
            config.height,
        );
        info!("region capacities: {:?}", config.capacities()?);

        let lost = Arc::new(Mutex::new(None));
        {
            let lost = lost.clone();
            device.set_device_lost_callback(move |reason, msg| {
                error!("device lost ({reason:?}): {msg}");
                if let Ok(mut v) = lost.lock() {
                    *v = Some(msg);
                }
            });
        }

        let mut cache = TemplateCache::new(&device);
        let state = EvaluationState::new(&device, &queue, &mut cache, &config);
        let regions = RegionArraySet::new(
            &device,
            &queue,
            &mut cache,
            config.surface,
            config.fanout(),
            config.generations,
        )?;
        let pipeline = SubdivisionPipeline::new(
            &device, &cache, &state, &regions, &config,
        );
        let present = PresentationPass::new(
            &device,
            &cache,
            &state,
            config.present_format,
        );
        debug!("{} distinct binding layouts", cache.len());

        let viewport = match config.surface {
            SurfaceKind::TwoD => Viewport::TwoD(View2::default()),
            SurfaceKind::ThreeD => Viewport::ThreeD(Camera3::default()),
        };
        Ok(Self {
            device,
            queue,
            config,
            cache,
            state,
            regions,
            pipeline,
            present,
            viewport,
            root_override: None,
            lost,
        })
    }

    /// Returns an error if the device has been lost
    fn check_device(&self) -> Result<(), Error> {
        match self.lost.lock() {
            Ok(v) => match v.as_ref() {
                Some(msg) => Err(Error::DeviceLost(msg.clone())),
                None => Ok(()),
            },
            Err(_) => Err(Error::DeviceLost("poisoned lock".to_owned())),
        }
    }

    /// Uploads a tape, replacing the previous one
    pub fn set_tape(&mut self, tape: &Tape) -> Result<(), Error> {
        let max = self.state.max_instructions();
        if tape.len() > max as usize {
            return Err(Error::TapeTooLong {
                len: tape.len(),
                max,
            });
        }
        self.state.set_tape(tape);
        Ok(())
    }

    /// Parses and uploads a tape in its wire format
    pub fn set_tape_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.set_tape(&Tape::from_bytes(bytes)?)
    }

    /// Sets the 2D view
    pub fn set_view2(&mut self, view: View2) -> Result<(), Error> {
        match self.viewport {
            Viewport::TwoD(..) => {
                self.viewport = Viewport::TwoD(view);
                Ok(())
            }
            Viewport::ThreeD(..) => Err(Error::WrongTransform { expected: 3 }),
        }
    }

    /// Sets the 3D camera
    pub fn set_camera3(&mut self, camera: Camera3) -> Result<(), Error> {
        match self.viewport {
            Viewport::ThreeD(..) => {
                self.viewport = Viewport::ThreeD(camera);
                Ok(())
            }
            Viewport::TwoD(..) => Err(Error::WrongTransform { expected: 2 }),
        }
    }

    /// Writes a root region into generation 0 and pins it for later frames
    ///
    /// Until [`follow_viewport`](Self::follow_viewport) is called, frames
    /// start from this region instead of one derived from the viewport.  For
    /// 2D surfaces, the Z bounds are ignored.
    pub fn set_initial_region(&mut self, region: Region) {
        self.regions.set_root_region(&region);
        self.root_override = Some(region);
    }

    /// Goes back to deriving the root region from the viewport
    pub fn follow_viewport(&mut self) {
        self.root_override = None;
    }

    /// Recreates the output image at a new size
    pub fn resize(&mut self, width: u32, height: u32) -> Result<(), Error> {
        self.config
            .check_image_size(width, height, &self.device.limits())?;
        self.state.resize(&self.cache, width, height);
        Ok(())
    }

    /// Returns the screen-to-evaluation transform for the current viewport
    pub fn screen_to_eval(&self) -> Result<Transform, Error> {
        let (width, height) = self.state.size();
        match self.viewport {
            Viewport::TwoD(view) => {
                Ok(Transform::TwoD(view.screen_to_eval(width, height)))
            }
            Viewport::ThreeD(camera) => camera
                .screen_to_eval(width, height)
                .map(Transform::ThreeD)
                .ok_or(Error::SingularTransform),
        }
    }

    /// Runs the subdivision passes, leaving the result in the output image
    pub fn evaluate(&mut self) -> Result<FrameOutcome, Error> {
        self.run_frame(None)
    }

    /// Runs the subdivision passes and draws the result onto `target`
    ///
    /// If `width` and `height` differ from the current output size, the output
    /// image is resized first.
    pub fn evaluate_and_render(
        &mut self,
        target: &wgpu::TextureView,
        width: u32,
        height: u32,
    ) -> Result<FrameOutcome, Error> {
        if self.state.size() != (width, height) {
            self.resize(width, height)?;
        }
        self.run_frame(Some(target))
    }

    fn run_frame(
        &mut self,
        target: Option<&wgpu::TextureView>,
    ) -> Result<FrameOutcome, Error> {
        self.check_device()?;
        let Some(tape_len) = self.state.tape_len() else {
            warn!("no tape set; skipping frame");
            return Ok(FrameOutcome::Skipped);
        };

        let transform = self.screen_to_eval()?;
        self.state.set_transform(transform)?;
        let (width, height) = self.state.size();
        let root = self.root_override.unwrap_or_else(|| {
            viewport_root(&transform, width, height, &self.config.bounds)
        });
        debug!("frame with {tape_len} instructions, root {root:?}");

        let n = self.config.generations;
        let mut stage = FrameStage::Idle;
        self.regions.reset_for_frame();
        self.regions.set_root_region(&root);
        stage = stage.next(n);

        let mut encoder =
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("frame"),
                });
        self.state.clear_output(&mut encoder);
        for pass in self.pipeline.plan() {
            stage = stage.next(n);
            debug_assert_eq!(stage, FrameStage::Pass(pass.index));
            self.pipeline.encode_pass(
                &mut encoder,
                pass,
                &self.state,
                &self.regions,
            );
        }
        self.pipeline.encode_resolve(&mut encoder, &self.state);
        stage = stage.next(n);
        debug_assert_eq!(stage, FrameStage::Shaded);

        if let Some(target) = target {
            self.present.encode(&mut encoder, target, &self.state);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(FrameOutcome::Rendered)
    }

    /// Builds a texture suitable as a presentation target
    ///
    /// The texture can also be read back with [`read_texture`].
    pub fn create_target(&self, width: u32, height: u32) -> wgpu::Texture {
        self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some("target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: self.present.format(),
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        })
    }

    /// Reads back the output image, with a blocking wait
    ///
    /// Texels are 4 bytes each, in row-major order: RGBA for 2D surfaces and
    /// little-endian depth keys for 3D surfaces.
    pub fn read_output(&self) -> Result<Vec<u8>, Error> {
        read_texture(&self.device, &self.queue, self.state.output())
    }

    /// Reads back the depth keys of a 3D output image, with a blocking wait
    ///
    /// Zero means that nothing was drawn at a pixel; larger keys are nearer.
    pub fn read_depth(&self) -> Result<Vec<u32>, Error> {
        Ok(self
            .read_output()?
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Reads back the regions stored in one generation, with a blocking wait
    pub fn read_regions(
        &self,
        generation: usize,
    ) -> Result<Vec<Region>, Error> {
        let kind = self.config.surface;
        let words: Vec<f32> = read_buffer(
            &self.device,
            &self.queue,
            self.regions.buffer(generation),
        )?;
        let count = (words[0].to_bits() as u64)
            .min(self.regions.allocated_region_count(generation))
            as usize;
        let stride = kind.dims() * 2;
        Ok(words[3..]
            .chunks_exact(stride)
            .take(count)
            .map(|r| Region::from_words(r, kind))
            .collect())
    }

    /// Returns the device
    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    /// Returns the queue
    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Returns the configuration
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Returns the output size, in pixels
    pub fn size(&self) -> (u32, u32) {
        self.state.size()
    }

    /// Returns resource counters for the output image
    pub fn resource_stats(&self) -> ResourceStats {
        self.state.stats()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        compiler::compile, gpu::test_device, tape::eval_point, types::Interval,
    };
    use nalgebra::{Matrix3, Matrix4, Vector2};

    fn view2(scale: f32) -> View2 {
        View2::from_center_and_scale(Vector2::zeros(), scale)
    }

    fn renderer(config: RendererConfig) -> Option<Renderer> {
        let (device, queue) = test_device()?;
        Some(Renderer::new(device, queue, config).unwrap())
    }

    fn circle_config(size: u32) -> RendererConfig {
        RendererConfig {
            width: size,
            height: size,
            inside_color: [1.0; 4],
            outside_color: [0.0, 0.0, 0.0, 1.0],
            ..RendererConfig::new_2d()
        }
    }

    #[test]
    fn root_2d() {
        let view = view2(16.0);
        let t = Transform::TwoD(view.screen_to_eval(256, 256));
        let root = viewport_root(&t, 256, 256, &Region::cube(-1.0, 1.0));
        assert_eq!(root.x, Interval::new(-16.0, 16.0));
        assert_eq!(root.y, Interval::new(-16.0, 16.0));
        assert_eq!(root.z, Interval::from(0.0));

        let t = Transform::TwoD(Matrix3::new_translation(&Vector2::new(
            1.0, 2.0,
        )));
        let root = viewport_root(&t, 4, 8, &Region::cube(-1.0, 1.0));
        assert_eq!(root.x, Interval::new(1.0, 5.0));
        assert_eq!(root.y, Interval::new(2.0, 10.0));
    }

    #[test]
    fn root_3d() {
        let camera = Camera3::default();
        let t = Transform::ThreeD(camera.screen_to_eval(64, 64).unwrap());
        let bounds = Region::cube(-16.0, 16.0);
        let root = viewport_root(&t, 64, 64, &bounds);
        // The far plane is well beyond the bounds, so they clamp every axis
        assert_eq!(root, bounds);

        let far = Region::cube(1000.0, 1001.0);
        assert_eq!(viewport_root(&t, 64, 64, &far), far);
    }

    #[test]
    fn root_non_finite() {
        let bounds = Region::cube(-4.0, 4.0);
        let t = Transform::TwoD(view2(f32::NAN).screen_to_eval(64, 64));
        assert_eq!(viewport_root(&t, 64, 64, &bounds), bounds);
        let t = Transform::ThreeD(Matrix4::from_element(f32::INFINITY));
        assert_eq!(viewport_root(&t, 64, 64, &bounds), bounds);
    }

    #[test]
    fn skipped_without_tape() {
        let Some(mut r) = renderer(circle_config(64)) else {
            return;
        };
        assert_eq!(r.evaluate().unwrap(), FrameOutcome::Skipped);
    }

    #[test]
    fn api_errors() {
        let Some(mut r) = renderer(circle_config(64)) else {
            return;
        };
        assert!(matches!(
            r.set_camera3(Camera3::default()),
            Err(Error::WrongTransform { expected: 2 })
        ));
        assert!(matches!(r.resize(0, 10), Err(Error::BadImageSize(0, 10))));
        assert!(matches!(
            r.set_tape_bytes(&[1, 0]),
            Err(Error::MissingTapeHeader)
        ));

        let config = RendererConfig {
            max_instructions: 4,
            ..circle_config(64)
        };
        let Some(mut r) = renderer(config) else {
            return;
        };
        // A NaN view is rejected rather than reaching the GPU
        r.set_tape(&compile("x^2 + y^2 - 4").unwrap()).unwrap();
        r.set_view2(view2(f32::NAN)).unwrap();
        assert!(matches!(r.evaluate(), Err(Error::SingularTransform)));
        r.set_view2(view2(16.0)).unwrap();
        assert_eq!(r.evaluate().unwrap(), FrameOutcome::Rendered);

        let tape = compile("x^2 + y^2 + sqrt(x) - 4").unwrap();
        assert!(tape.len() > 4);
        assert!(matches!(
            r.set_tape(&tape),
            Err(Error::TapeTooLong { max: 4, .. })
        ));
    }

    /// Checks a 2D circle of radius 2 against the CPU evaluator
    fn check_circle(r: &Renderer, tape: &Tape, size: u32) {
        let pixels = r.read_output().unwrap();
        assert_eq!(pixels.len(), (size * size * 4) as usize);
        let scale = 32.0 / size as f32;
        for py in 0..size {
            for px in 0..size {
                let i = ((py * size + px) * 4) as usize;
                let p = &pixels[i..i + 4];
                assert_eq!(p[3], 255, "pixel ({px}, {py}) was never written");

                let x = (px as f32 + 0.5) * scale - 16.0;
                let y = 16.0 - (py as f32 + 0.5) * scale;
                if (x * x + y * y - 4.0).abs() < 0.5 {
                    continue;
                }
                let inside = eval_point(tape, x, y, 0.0) < 0.0;
                let expected = if inside { 255 } else { 0 };
                assert_eq!(
                    &p[..3],
                    &[expected; 3],
                    "bad color at pixel ({px}, {py})"
                );
            }
        }
    }

    #[test]
    fn circle_2d() {
        let Some(mut r) = renderer(circle_config(256)) else {
            return;
        };
        let tape = compile("x^2 + y^2 - 4").unwrap();
        r.set_tape(&tape).unwrap();
        r.set_view2(view2(16.0)).unwrap();
        assert_eq!(r.evaluate().unwrap(), FrameOutcome::Rendered);
        check_circle(&r, &tape, 256);

        // Only cells touching the circle's boundary survive the first pass
        let regions = r.read_regions(1).unwrap();
        assert!(!regions.is_empty());
        assert!(regions.len() < 64);
        for reg in &regions {
            let near = |i: Interval| i.lower() <= 2.0 && i.upper() >= -2.0;
            assert!(near(reg.x) && near(reg.y), "bad region {reg:?}");
        }

        // Rendering again gives identical bytes
        let first = r.read_output().unwrap();
        r.evaluate().unwrap();
        assert_eq!(r.read_output().unwrap(), first);
    }

    /// Checks that a frame left generation 0 holding exactly the root region
    fn check_generation_zero(r: &Renderer, root: &Region) {
        let kind = r.config().surface;
        let words: Vec<u32> =
            read_buffer(r.device(), r.queue(), r.regions.buffer(0)).unwrap();
        assert_eq!(&words[..3], &[1, 1, 1], "generation 0 header changed");
        let n = kind.dims() * 2;
        let data: Vec<f32> =
            words[3..3 + n].iter().map(|w| f32::from_bits(*w)).collect();
        assert_eq!(&Region::from_words(&data, kind), root);
        assert_eq!(r.read_regions(0).unwrap(), [*root]);
    }

    #[test]
    fn terminal_pass_spares_generation_zero() {
        for generations in [2, 3] {
            let config = RendererConfig {
                generations,
                ..circle_config(256)
            };
            let Some(mut r) = renderer(config) else {
                return;
            };
            let tape = compile("x^2 + y^2 - 4").unwrap();
            r.set_tape(&tape).unwrap();
            r.set_view2(view2(16.0)).unwrap();
            for _ in 0..2 {
                r.evaluate().unwrap();
                let t = r.screen_to_eval().unwrap();
                let root = viewport_root(&t, 256, 256, &r.config().bounds);
                check_generation_zero(&r, &root);
            }
            check_circle(&r, &tape, 256);
        }

        let config = RendererConfig {
            width: 64,
            height: 64,
            ..RendererConfig::new_3d()
        };
        let Some(mut r) = renderer(config) else {
            return;
        };
        r.set_tape(&compile("x^2 + y^2 + z^2 - 4").unwrap()).unwrap();
        let root = Region::cube(-4.0, 4.0);
        r.set_initial_region(root);
        r.evaluate().unwrap();
        check_generation_zero(&r, &root);
    }

    #[test]
    fn present_and_resize() {
        let Some(mut r) = renderer(circle_config(256)) else {
            return;
        };
        let tape = compile("x^2 + y^2 - 4").unwrap();
        r.set_tape(&tape).unwrap();
        r.set_view2(view2(16.0)).unwrap();

        let target = r.create_target(64, 64);
        let view = target.create_view(&wgpu::TextureViewDescriptor::default());
        let out = r.evaluate_and_render(&view, 64, 64).unwrap();
        assert_eq!(out, FrameOutcome::Rendered);
        assert_eq!(r.size(), (64, 64));
        assert_eq!(r.resource_stats().textures_created, 2);
        check_circle(&r, &tape, 64);

        let pixels = read_texture(r.device(), r.queue(), &target).unwrap();
        let at = |x: usize, y: usize| &pixels[(y * 64 + x) * 4..][..4];
        assert_eq!(at(32, 32), &[255, 255, 255, 255]);
        assert_eq!(at(0, 0), &[0, 0, 0, 255]);
    }

    #[test]
    fn pinned_root() {
        let Some(mut r) = renderer(circle_config(64)) else {
            return;
        };
        r.set_tape(&compile("x^2 + y^2 - 4").unwrap()).unwrap();
        r.set_view2(view2(16.0)).unwrap();

        // A root far from the circle is classified in the first pass
        r.set_initial_region(Region::new([8.0, 16.0], [8.0, 16.0], 0.0));
        r.evaluate().unwrap();
        assert!(r.read_regions(1).unwrap().is_empty());
        let pixels = r.read_output().unwrap();
        assert_eq!(&pixels[..4], &[0, 0, 0, 0], "outside the pinned root");
        let i = (8 * 64 + 56) * 4;
        assert_eq!(&pixels[i..i + 4], &[0, 0, 0, 255]);

        r.follow_viewport();
        r.evaluate().unwrap();
        assert!(!r.read_regions(1).unwrap().is_empty());
    }

    #[test]
    fn sphere_3d() {
        let config = RendererConfig {
            width: 128,
            height: 128,
            ..RendererConfig::new_3d()
        };
        let Some(mut r) = renderer(config) else {
            return;
        };
        r.set_tape(&compile("x^2 + y^2 + z^2 - 4").unwrap()).unwrap();
        r.set_camera3(Camera3::look_at(
            Point3::new(0.0, 0.0, 10.0),
            Point3::origin(),
        ))
        .unwrap();
        assert_eq!(r.evaluate().unwrap(), FrameOutcome::Rendered);

        let depth = r.read_depth().unwrap();
        assert_eq!(depth.len(), 128 * 128);
        assert!(depth[64 * 128 + 64] > 0, "center should hit the sphere");
        assert_eq!(depth[0], 0, "corner should miss the sphere");

        r.evaluate().unwrap();
        assert_eq!(r.read_depth().unwrap(), depth);
    }
}
