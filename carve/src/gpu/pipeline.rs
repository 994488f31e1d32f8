//! Compute pipelines for adaptive subdivision
//!
//! A frame runs one compute pass per generation.  Pass `i` reads generation
//! `i` and appends ambiguous cells to generation `i + 1`; the last pass shades
//! its ambiguous cells instead.  The last pass still binds an output region
//! array, which aliases generation 0.  Nothing is written to it, and the root
//! region is rewritten at the start of every frame.
use crate::{
    config::RendererConfig,
    gpu::{
        regions::RegionArraySet, state::EvaluationState, subdivide_shader,
        template::TemplateCache,
    },
    types::SurfaceKind,
};
use log::debug;

const INSIDE: [&str; 4] = ["INSIDE_R", "INSIDE_G", "INSIDE_B", "INSIDE_A"];
const OUTSIDE: [&str; 4] =
    ["OUTSIDE_R", "OUTSIDE_G", "OUTSIDE_B", "OUTSIDE_A"];

/// Which pipeline a pass uses
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Variant {
    /// Emits ambiguous cells to the next generation
    Emit,
    /// Shades ambiguous cells directly
    Terminal,
}

/// How a pass's workgroup count is chosen
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// Fixed workgroup count along X
    Direct(u32),
    /// Read from the header of a region array
    Indirect {
        /// Generation whose header holds the dispatch arguments
        generation: usize,
    },
}

/// One compute pass of a frame
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PassPlan {
    /// Pass index
    pub index: usize,
    /// Generation read by this pass
    pub input: usize,
    /// Generation bound as output
    pub output: usize,
    /// Pipeline variant
    pub variant: Variant,
    /// Workgroup count
    pub dispatch: Dispatch,
}

/// Returns the sequence of passes for a ring of `generations` region arrays
///
/// # Panics
/// If `generations < 2`
pub fn plan(generations: usize) -> Vec<PassPlan> {
    assert!(generations >= 2, "need at least two generations");
    (0..generations)
        .map(|i| PassPlan {
            index: i,
            input: i,
            output: (i + 1) % generations,
            variant: if i + 1 == generations {
                Variant::Terminal
            } else {
                Variant::Emit
            },
            dispatch: if i == 0 {
                Dispatch::Direct(1)
            } else {
                Dispatch::Indirect { generation: i }
            },
        })
        .collect()
}

/// Progress through a frame
///
/// Frames always move through
/// `Idle → RootSet → Pass(0) → … → Pass(N-1) → Shaded`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameStage {
    /// No frame in progress
    Idle,
    /// Headers reset and root region written
    RootSet,
    /// Encoding the given pass
    Pass(usize),
    /// Every pass has been encoded
    Shaded,
}

impl FrameStage {
    /// Returns the next stage, given the number of passes per frame
    pub fn next(self, generations: usize) -> Self {
        match self {
            FrameStage::Idle => FrameStage::RootSet,
            FrameStage::RootSet => FrameStage::Pass(0),
            FrameStage::Pass(i) if i + 1 < generations => {
                FrameStage::Pass(i + 1)
            }
            FrameStage::Pass(_) => FrameStage::Shaded,
            FrameStage::Shaded => FrameStage::Idle,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////

/// Emit and terminal subdivision pipelines, plus the 3D depth resolve
pub struct SubdivisionPipeline {
    emit: wgpu::ComputePipeline,
    terminal: wgpu::ComputePipeline,
    resolve: Option<wgpu::ComputePipeline>,
    plan: Vec<PassPlan>,
}

impl SubdivisionPipeline {
    /// Builds pipelines for the given state and region arrays
    pub fn new(
        device: &wgpu::Device,
        cache: &TemplateCache,
        state: &EvaluationState,
        regions: &RegionArraySet,
        config: &RendererConfig,
    ) -> Self {
        let kind = config.surface;
        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("subdivide"),
                bind_group_layouts: &[
                    cache.layout(state.compute_layout()),
                    cache.layout(regions.input_layout()),
                    cache.layout(regions.output_layout()),
                ],
                push_constant_ranges: &[],
            });
        let shader_code = subdivide_shader(kind, config.split);
        let new_module = |label: &str| {
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(shader_code.as_str().into()),
            })
        };

        // One module per specialization: the GL backend caches a single
        // program per (module, entry point), ignoring override constants
        let build = |variant: Variant| {
            let mut constants = vec![(
                "EMIT_SUBREGIONS",
                if variant == Variant::Emit { 1.0 } else { 0.0 },
            )];
            if kind == SurfaceKind::TwoD {
                for (names, color) in [
                    (INSIDE, config.inside_color),
                    (OUTSIDE, config.outside_color),
                ] {
                    constants.extend(
                        names.into_iter().zip(color.map(|c| c as f64)),
                    );
                }
            }
            debug!("building {variant:?} subdivision pipeline");
            let shader_module =
                new_module(&format!("subdivide ({variant:?})"));
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(&format!("subdivide ({variant:?})")),
                layout: Some(&pipeline_layout),
                module: &shader_module,
                entry_point: Some("subdivide_main"),
                compilation_options: wgpu::PipelineCompilationOptions {
                    constants: &constants,
                    ..Default::default()
                },
                cache: None,
            })
        };
        let emit = build(Variant::Emit);
        let terminal = build(Variant::Terminal);

        let resolve = (kind == SurfaceKind::ThreeD).then(|| {
            let layout = device.create_pipeline_layout(
                &wgpu::PipelineLayoutDescriptor {
                    label: Some("resolve"),
                    bind_group_layouts: &[
                        cache.layout(state.compute_layout())
                    ],
                    push_constant_ranges: &[],
                },
            );
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some("resolve"),
                layout: Some(&layout),
                module: &new_module("resolve"),
                entry_point: Some("resolve_main"),
                compilation_options: Default::default(),
                cache: None,
            })
        });

        Self {
            emit,
            terminal,
            resolve,
            plan: plan(config.generations),
        }
    }

    /// Returns the per-frame pass sequence
    pub fn plan(&self) -> &[PassPlan] {
        &self.plan
    }

    /// Records one subdivision pass
    pub fn encode_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        pass: &PassPlan,
        state: &EvaluationState,
        regions: &RegionArraySet,
    ) {
        let mut compute_pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(&format!("subdivide {}", pass.index)),
                timestamp_writes: None,
            });
        compute_pass.set_pipeline(match pass.variant {
            Variant::Emit => &self.emit,
            Variant::Terminal => &self.terminal,
        });
        compute_pass.set_bind_group(0, state.compute_bind_group(), &[]);
        compute_pass.set_bind_group(
            1,
            regions.input_bind_group(pass.input),
            &[],
        );
        compute_pass.set_bind_group(
            2,
            regions.output_bind_group(pass.output),
            &[],
        );
        match pass.dispatch {
            Dispatch::Direct(n) => compute_pass.dispatch_workgroups(n, 1, 1),
            Dispatch::Indirect { generation } => compute_pass
                .dispatch_workgroups_indirect(regions.buffer(generation), 0),
        }
    }

    /// Records the depth resolve pass, which is a no-op for 2D surfaces
    pub fn encode_resolve(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        state: &EvaluationState,
    ) {
        let Some(resolve) = &self.resolve else {
            return;
        };
        let mut compute_pass =
            encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("resolve"),
                timestamp_writes: None,
            });
        compute_pass.set_pipeline(resolve);
        compute_pass.set_bind_group(0, state.compute_bind_group(), &[]);
        let (width, height) = state.size();
        compute_pass.dispatch_workgroups(
            width.div_ceil(8),
            height.div_ceil(8),
            1,
        );
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plan_ring() {
        let p = plan(3);
        assert_eq!(p.len(), 3);
        assert_eq!(
            p[0],
            PassPlan {
                index: 0,
                input: 0,
                output: 1,
                variant: Variant::Emit,
                dispatch: Dispatch::Direct(1),
            }
        );
        assert_eq!(p[1].input, 1);
        assert_eq!(p[1].output, 2);
        assert_eq!(p[1].dispatch, Dispatch::Indirect { generation: 1 });

        // The terminal pass's output binding aliases generation 0
        assert_eq!(p[2].variant, Variant::Terminal);
        assert_eq!(p[2].input, 2);
        assert_eq!(p[2].output, 0);
        assert_eq!(p[2].dispatch, Dispatch::Indirect { generation: 2 });
    }

    #[test]
    fn plan_minimal() {
        let p = plan(2);
        assert_eq!(p[0].variant, Variant::Emit);
        assert_eq!(p[1].variant, Variant::Terminal);
        assert_eq!(p[1].output, 0);
        for i in 2..8 {
            let p = plan(i);
            assert_eq!(
                p.iter().filter(|p| p.variant == Variant::Terminal).count(),
                1
            );
            assert!(p.iter().all(|p| p.input != p.output));
        }
    }

    #[test]
    fn frame_stages() {
        let mut s = FrameStage::Idle;
        let mut seen = vec![s];
        while s != FrameStage::Shaded {
            s = s.next(3);
            seen.push(s);
        }
        assert_eq!(
            seen,
            [
                FrameStage::Idle,
                FrameStage::RootSet,
                FrameStage::Pass(0),
                FrameStage::Pass(1),
                FrameStage::Pass(2),
                FrameStage::Shaded,
            ]
        );
        assert_eq!(s.next(3), FrameStage::Idle);
    }
}
