//! GPU pipeline for adaptive subdivision
//!
//! The [`Renderer`] is the main entry point.  The other types are exposed for
//! callers that want to drive individual stages (e.g. for testing or to embed
//! the passes in a larger frame).
use crate::types::SurfaceKind;
use heck::ToShoutySnakeCase;

mod pipeline;
mod present;
mod regions;
mod renderer;
mod state;
mod template;
mod util;

pub use pipeline::{
    Dispatch, FrameStage, PassPlan, SubdivisionPipeline, Variant, plan,
};
pub use present::PresentationPass;
pub use regions::{REGION_HEADER_SIZE, RegionArraySet, buffer_size, capacity};
pub use renderer::{FrameOutcome, Renderer, viewport_root};
pub use state::{EvaluationState, ResourceStats, Transform};
pub use template::{
    BindResource, BindingKind, LayoutDesc, LayoutId, SampleKind, TemplateCache,
};
pub use util::{read_buffer, read_texture};

const COMMON_SHADER: &str = include_str!("shaders/common.wgsl");
const INTERVAL_OPS_SHADER: &str = include_str!("shaders/interval_ops.wgsl");
const TAPE_INTERPRETER: &str = include_str!("shaders/tape_interpreter.wgsl");
const SUBDIVIDE_2D_SHADER: &str = include_str!("shaders/subdivide_2d.wgsl");
const SUBDIVIDE_3D_SHADER: &str = include_str!("shaders/subdivide_3d.wgsl");
const PRESENT_SHADER: &str = include_str!("shaders/present.wgsl");
const PRESENT_2D_SHADER: &str = include_str!("shaders/present_2d.wgsl");
const PRESENT_3D_SHADER: &str = include_str!("shaders/present_3d.wgsl");

/// Returns a set of constant definitions for each opcode
fn opcode_constants() -> String {
    let mut out = String::new();
    for (op, i) in crate::tape::iter_ops() {
        let name = op.to_shouty_snake_case();
        out += &format!("const OP_{name}: u32 = {i};\n");
    }
    out
}

/// Returns the subdivision shader for a surface kind and per-axis split
pub(crate) fn subdivide_shader(kind: SurfaceKind, split: u32) -> String {
    let mut shader_code = opcode_constants();
    shader_code += &format!(
        "const REG_COUNT: u32 = {};\nconst SPLIT: u32 = {split};\n",
        crate::tape::REG_COUNT
    );
    shader_code += match kind {
        SurfaceKind::TwoD => SUBDIVIDE_2D_SHADER,
        SurfaceKind::ThreeD => SUBDIVIDE_3D_SHADER,
    };
    shader_code += COMMON_SHADER;
    shader_code += INTERVAL_OPS_SHADER;
    shader_code += TAPE_INTERPRETER;
    shader_code
}

/// Returns the presentation shader for a surface kind
pub(crate) fn present_shader(kind: SurfaceKind) -> String {
    PRESENT_SHADER.to_owned()
        + match kind {
            SurfaceKind::TwoD => PRESENT_2D_SHADER,
            SurfaceKind::ThreeD => PRESENT_3D_SHADER,
        }
}

/// Builds a device for GPU tests, or `None` if there's no adapter
#[cfg(test)]
pub(crate) fn test_device() -> Option<(wgpu::Device, wgpu::Queue)> {
    let instance = wgpu::Instance::default();
    let out = pollster::block_on(async {
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions::default())
            .await
            .ok()?;
        adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("test"),
                required_limits: adapter.limits(),
                ..Default::default()
            })
            .await
            .ok()
    });
    if out.is_none() {
        log::warn!("no GPU adapter available; skipping test");
    }
    out
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn shader_has_all_ops() {
        for (op, _) in crate::tape::iter_ops() {
            let op = format!("OP_{}", op.to_shouty_snake_case());
            assert!(
                TAPE_INTERPRETER.matches(&op).count() >= 2,
                "tape interpreter is missing {op} in one of its evaluators"
            );
        }
    }

    #[test]
    fn transform_layout() {
        for kind in [SurfaceKind::TwoD, SurfaceKind::ThreeD] {
            let src = subdivide_shader(kind, 4);
            let m = naga::front::wgsl::parse_str(&src).unwrap();
            let (members, span) = m
                .types
                .iter()
                .find_map(|(_, t)| match &t.inner {
                    naga::TypeInner::Struct { members, span }
                        if t.name.as_deref() == Some("Transform") =>
                    {
                        Some((members, *span))
                    }
                    _ => None,
                })
                .expect("missing `Transform` struct");
            let offsets: Vec<u32> = members.iter().map(|m| m.offset).collect();
            assert_eq!(offsets, [0, 64, 128], "bad {kind:?} layout");
            assert!(span <= 144, "{kind:?} transform is {span} bytes");
        }
    }

    #[test]
    fn compile_shaders() {
        let mut v = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        );
        for (src, desc) in [
            (subdivide_shader(SurfaceKind::TwoD, 8), "subdivide 2D"),
            (subdivide_shader(SurfaceKind::ThreeD, 4), "subdivide 3D"),
            (subdivide_shader(SurfaceKind::TwoD, 2), "subdivide 2D (small)"),
            (present_shader(SurfaceKind::TwoD), "present 2D"),
            (present_shader(SurfaceKind::ThreeD), "present 3D"),
        ] {
            // This isn't the best formatting, but it will at least include the
            // relevant text.
            let m = naga::front::wgsl::parse_str(&src).unwrap_or_else(|e| {
                if let Some(i) = e.location(&src) {
                    let pos = i.offset as usize..(i.offset + i.length) as usize;
                    panic!(
                        "shader compilation failed\n{src}\n{}",
                        e.emit_to_string_with_path(&src[pos], desc)
                    );
                } else {
                    panic!(
                        "shader compilation failed\n{src}\n{}",
                        e.emit_to_string(desc)
                    );
                }
            });
            if let Err(e) = v.validate(&m) {
                let (pos, desc) = e.spans().next().unwrap();
                panic!(
                    "shader compilation failed\n{src}\n{}",
                    e.emit_to_string_with_path(
                        &src[pos.to_range().unwrap()],
                        desc
                    )
                );
            }
        }
    }
}
