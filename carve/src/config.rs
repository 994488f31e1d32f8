//! Renderer configuration
use crate::{
    Error,
    gpu::{buffer_size, capacity},
    tape::{HEADER_SIZE, MAX_INSTS},
    types::{Region, SurfaceKind},
};

/// Static settings for a [`Renderer`](crate::gpu::Renderer)
///
/// These values size every GPU buffer, so they are fixed for the lifetime of
/// the renderer (except for the output size, which changes on resize).
#[derive(Copy, Clone, Debug)]
pub struct RendererConfig {
    /// Surface dimensionality
    pub surface: SurfaceKind,

    /// Number of cells per axis when a region is subdivided
    ///
    /// This is also the compute workgroup width, so the fan-out per generation
    /// is `split²` for 2D surfaces and `split³` for 3D surfaces.
    pub split: u32,

    /// Number of region generations (and compute passes) per frame
    pub generations: usize,

    /// Capacity of the tape buffer, in instructions
    pub max_instructions: u32,

    /// Initial output size, in pixels
    pub width: u32,

    /// Initial output size, in pixels
    pub height: u32,

    /// Scene bounds, used to clamp the root region for 3D surfaces
    pub bounds: Region,

    /// Color for pixels inside a 2D shape
    pub inside_color: [f32; 4],

    /// Color for pixels outside a 2D shape
    pub outside_color: [f32; 4],

    /// Format of the presentation target
    pub present_format: wgpu::TextureFormat,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            surface: SurfaceKind::TwoD,
            split: 8,
            generations: 3,
            max_instructions: MAX_INSTS,
            width: 1024,
            height: 1024,
            bounds: Region::cube(-16.0, 16.0),
            inside_color: [1.0, 1.0, 1.0, 1.0],
            outside_color: [0.0, 0.0, 0.0, 1.0],
            present_format: wgpu::TextureFormat::Rgba8Unorm,
        }
    }
}

impl RendererConfig {
    /// Default settings for 2D rendering
    pub fn new_2d() -> Self {
        Self::default()
    }

    /// Default settings for 3D rendering
    pub fn new_3d() -> Self {
        Self {
            surface: SurfaceKind::ThreeD,
            split: 4,
            ..Self::default()
        }
    }

    /// Maximum number of child regions one region produces in a single pass
    pub fn fanout(&self) -> u64 {
        (self.split as u64).pow(self.surface.dims() as u32)
    }

    /// Returns the per-generation region capacities
    ///
    /// Generation `g` holds `fanout^g` regions.
    pub fn capacities(&self) -> Result<Vec<u64>, Error> {
        let fanout = self.fanout();
        (0..self.generations)
            .map(|generation| {
                capacity(generation, fanout).ok_or(Error::CapacityOverflow {
                    generation,
                    fanout,
                })
            })
            .collect()
    }

    /// Checks the configuration against device limits
    ///
    /// This is the only check standing between a bad configuration and
    /// out-of-bounds GPU writes, so it must pass before any buffer is built.
    pub fn validate(&self, limits: &wgpu::Limits) -> Result<(), Error> {
        if self.split < 2
            || self.split > limits.max_compute_workgroup_size_x
            || self.split > limits.max_compute_workgroup_size_y
            || (self.surface == SurfaceKind::ThreeD
                && self.split > limits.max_compute_workgroup_size_z)
            || self.fanout()
                > limits.max_compute_invocations_per_workgroup as u64
        {
            return Err(Error::BadSplit(self.split));
        }
        if self.generations < 2 {
            return Err(Error::BadGenerationCount(self.generations));
        }
        self.check_image_size(self.width, self.height, limits)?;

        let tape_size =
            HEADER_SIZE as u64 + self.max_instructions as u64 * 8;
        if tape_size > limits.max_storage_buffer_binding_size as u64
            || tape_size > limits.max_buffer_size
        {
            return Err(Error::TapeBufferTooLarge(self.max_instructions));
        }

        let fanout = self.fanout();
        let buffer_limit = (limits.max_storage_buffer_binding_size as u64)
            .min(limits.max_buffer_size);
        for (generation, cap) in self.capacities()?.into_iter().enumerate() {
            // Every generation is consumed by an indirect dispatch with one
            // workgroup per region
            if cap > limits.max_compute_workgroups_per_dimension as u64 {
                return Err(Error::DispatchLimit {
                    generation,
                    capacity: cap,
                    limit: limits.max_compute_workgroups_per_dimension,
                });
            }
            let size = buffer_size(generation, fanout, self.surface).ok_or(
                Error::CapacityOverflow { generation, fanout },
            )?;
            if size > buffer_limit {
                return Err(Error::BufferTooLarge {
                    generation,
                    size,
                    limit: buffer_limit,
                });
            }
        }
        Ok(())
    }

    /// Checks that an output image size is usable
    pub(crate) fn check_image_size(
        &self,
        width: u32,
        height: u32,
        limits: &wgpu::Limits,
    ) -> Result<(), Error> {
        let max = limits.max_texture_dimension_2d;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(Error::BadImageSize(width, height));
        }
        if self.surface == SurfaceKind::ThreeD {
            let lock_size = width as u64 * height as u64 * 4;
            if lock_size > limits.max_storage_buffer_binding_size as u64 {
                return Err(Error::BadImageSize(width, height));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let limits = wgpu::Limits::default();
        RendererConfig::new_2d().validate(&limits).unwrap();
        RendererConfig::new_3d().validate(&limits).unwrap();
        assert_eq!(RendererConfig::new_2d().fanout(), 64);
        assert_eq!(RendererConfig::new_3d().fanout(), 64);
        assert_eq!(
            RendererConfig::new_2d().capacities().unwrap(),
            vec![1, 64, 4096]
        );
    }

    #[test]
    fn dispatch_limit() {
        let limits = wgpu::Limits::default();
        let cfg = RendererConfig {
            generations: 4,
            ..RendererConfig::new_2d()
        };
        // 64^3 = 262144 regions cannot be launched by one indirect dispatch
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::DispatchLimit {
                generation: 3,
                capacity: 262144,
                ..
            })
        ));

        // 16x16 workgroups give 65536 regions in generation 2, one too many
        let cfg = RendererConfig {
            split: 16,
            ..RendererConfig::new_2d()
        };
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::DispatchLimit { generation: 2, .. })
        ));
    }

    #[test]
    fn bad_values() {
        let limits = wgpu::Limits::default();
        let cfg = RendererConfig {
            split: 1,
            ..RendererConfig::new_2d()
        };
        assert!(matches!(cfg.validate(&limits), Err(Error::BadSplit(1))));

        // 8^3 = 512 invocations is above the default workgroup limit
        let cfg = RendererConfig {
            split: 8,
            ..RendererConfig::new_3d()
        };
        assert!(matches!(cfg.validate(&limits), Err(Error::BadSplit(8))));

        let cfg = RendererConfig {
            generations: 1,
            ..RendererConfig::new_2d()
        };
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::BadGenerationCount(1))
        ));

        let cfg = RendererConfig {
            width: 0,
            ..RendererConfig::new_2d()
        };
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::BadImageSize(0, 1024))
        ));
    }

    #[test]
    fn buffer_limit() {
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: 1 << 16,
            ..wgpu::Limits::default()
        };
        // Generation 2 needs 12 + 4096 * 16 bytes
        let cfg = RendererConfig {
            max_instructions: 100,
            ..RendererConfig::new_2d()
        };
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::BufferTooLarge {
                generation: 2,
                size: 65548,
                ..
            })
        ));

        let cfg = RendererConfig::new_2d();
        assert!(matches!(
            cfg.validate(&limits),
            Err(Error::TapeBufferTooLarge(MAX_INSTS))
        ));
    }
}
