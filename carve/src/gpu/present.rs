//! Presentation of the output image onto a render target
use crate::gpu::{
    present_shader, state::EvaluationState, template::TemplateCache,
};

/// Fullscreen render pass that draws the output image
pub struct PresentationPass {
    pipeline: wgpu::RenderPipeline,
    format: wgpu::TextureFormat,
}

impl PresentationPass {
    /// Builds the presentation pipeline for a target format
    pub fn new(
        device: &wgpu::Device,
        cache: &TemplateCache,
        state: &EvaluationState,
        format: wgpu::TextureFormat,
    ) -> Self {
        let shader_module =
            device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some("present"),
                source: wgpu::ShaderSource::Wgsl(
                    present_shader(state.kind()).into(),
                ),
            });
        let pipeline_layout =
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("present"),
                bind_group_layouts: &[cache.layout(state.render_layout())],
                push_constant_ranges: &[],
            });
        let pipeline =
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("present"),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader_module,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader_module,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format,
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            });
        Self { pipeline, format }
    }

    /// Returns the target format
    pub fn format(&self) -> wgpu::TextureFormat {
        self.format
    }

    /// Records a draw of the output image onto `target`
    ///
    /// The target is cleared first, so it needs no particular prior contents.
    pub fn encode(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        target: &wgpu::TextureView,
        state: &EvaluationState,
    ) {
        let mut render_pass =
            encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some("present"),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: target,
                    depth_slice: None,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
        render_pass.set_pipeline(&self.pipeline);
        render_pass.set_bind_group(0, state.render_bind_group(), &[]);
        render_pass.draw(0..6, 0..1);
    }
}
