//! Ring of region arrays, one per generation
//!
//! Each region array is a GPU buffer with a 12-byte header followed by packed
//! regions:
//!
//! | Offset | Value                                         |
//! |--------|-----------------------------------------------|
//! | 0      | region count (also the X dispatch size)       |
//! | 4      | 1 (Y dispatch size)                           |
//! | 8      | 1 (Z dispatch size)                           |
//! | 12     | regions, as `[f32; 4]` (2D) or `[f32; 6]` (3D) |
//!
//! Since the header is laid out like `DispatchIndirectArgs`, a generation can
//! drive the indirect dispatch of the pass that consumes it without any CPU
//! round trip.
use crate::{
    Error,
    gpu::{
        template::{
            BindResource, BindingKind, LayoutDesc, LayoutId, TemplateCache,
        },
        util::new_buffer,
    },
    types::{Region, SurfaceKind},
};
use log::debug;
use zerocopy::IntoBytes;

/// Size of the region array header, in bytes
pub const REGION_HEADER_SIZE: u64 = 12;

/// Returns the region capacity of a generation (`fanout^generation`)
///
/// Returns `None` on overflow.
pub fn capacity(generation: usize, fanout: u64) -> Option<u64> {
    fanout.checked_pow(generation.try_into().ok()?)
}

/// Returns the buffer size of a generation, in bytes
///
/// Returns `None` on overflow.
pub fn buffer_size(
    generation: usize,
    fanout: u64,
    kind: SurfaceKind,
) -> Option<u64> {
    capacity(generation, fanout)?
        .checked_mul(kind.region_size())?
        .checked_add(REGION_HEADER_SIZE)
}

/// Ring of region arrays, plus their binding sets
///
/// Buffers are sized once, at construction, for the worst case of every cell
/// being ambiguous.
pub struct RegionArraySet {
    queue: wgpu::Queue,
    kind: SurfaceKind,
    capacities: Vec<u64>,
    buffers: Vec<wgpu::Buffer>,
    input_layout: LayoutId,
    output_layout: LayoutId,
    input_groups: Vec<wgpu::BindGroup>,
    output_groups: Vec<wgpu::BindGroup>,
}

impl RegionArraySet {
    /// Allocates `generations` region arrays
    ///
    /// Sizes are checked against device limits before anything is allocated.
    /// On success, every array has been reset with
    /// [`reset_for_frame`](Self::reset_for_frame).
    pub fn new(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        cache: &mut TemplateCache,
        kind: SurfaceKind,
        fanout: u64,
        generations: usize,
    ) -> Result<Self, Error> {
        let limits = device.limits();
        let buffer_limit = (limits.max_storage_buffer_binding_size as u64)
            .min(limits.max_buffer_size);
        let mut capacities = Vec::with_capacity(generations);
        let mut sizes = Vec::with_capacity(generations);
        for generation in 0..generations {
            let overflow = || Error::CapacityOverflow { generation, fanout };
            let cap = capacity(generation, fanout).ok_or_else(overflow)?;
            let size =
                buffer_size(generation, fanout, kind).ok_or_else(overflow)?;
            if size > buffer_limit {
                return Err(Error::BufferTooLarge {
                    generation,
                    size,
                    limit: buffer_limit,
                });
            }
            capacities.push(cap);
            sizes.push(size);
        }

        let buffers: Vec<wgpu::Buffer> = sizes
            .iter()
            .enumerate()
            .map(|(g, size)| {
                debug!("allocating region array {g} ({size} bytes)");
                new_buffer(
                    device,
                    &format!("regions {g}"),
                    *size,
                    wgpu::BufferUsages::STORAGE
                        | wgpu::BufferUsages::INDIRECT
                        | wgpu::BufferUsages::COPY_DST
                        | wgpu::BufferUsages::COPY_SRC,
                )
            })
            .collect();

        let input_layout = cache
            .register(LayoutDesc::compute(&[BindingKind::ReadOnlyStorage]));
        let output_layout =
            cache.register(LayoutDesc::compute(&[BindingKind::Storage]));
        let input_groups = buffers
            .iter()
            .enumerate()
            .map(|(g, b)| {
                cache.bind(
                    input_layout,
                    &format!("regions {g} (in)"),
                    &[BindResource::Buffer(b)],
                )
            })
            .collect();
        let output_groups = buffers
            .iter()
            .enumerate()
            .map(|(g, b)| {
                cache.bind(
                    output_layout,
                    &format!("regions {g} (out)"),
                    &[BindResource::Buffer(b)],
                )
            })
            .collect();

        let out = Self {
            queue: queue.clone(),
            kind,
            capacities,
            buffers,
            input_layout,
            output_layout,
            input_groups,
            output_groups,
        };
        out.reset_for_frame();
        Ok(out)
    }

    /// Returns the number of generations
    pub fn generations(&self) -> usize {
        self.buffers.len()
    }

    /// Returns the region capacity of a generation
    pub fn allocated_region_count(&self, generation: usize) -> u64 {
        self.capacities[generation]
    }

    /// Returns the buffer for a generation
    pub fn buffer(&self, generation: usize) -> &wgpu::Buffer {
        &self.buffers[generation]
    }

    /// Returns the read-only binding set for a generation
    pub fn input_bind_group(&self, generation: usize) -> &wgpu::BindGroup {
        &self.input_groups[generation]
    }

    /// Returns the read-write binding set for a generation
    pub fn output_bind_group(&self, generation: usize) -> &wgpu::BindGroup {
        &self.output_groups[generation]
    }

    /// Layout handle shared by every read-only binding set
    pub fn input_layout(&self) -> LayoutId {
        self.input_layout
    }

    /// Layout handle shared by every read-write binding set
    pub fn output_layout(&self) -> LayoutId {
        self.output_layout
    }

    /// Resets all headers for a new frame
    ///
    /// Generation 0 gets a count of 1 (the root region); every other
    /// generation gets a count of 0.  Region data is left untouched.
    pub fn reset_for_frame(&self) {
        for (g, buf) in self.buffers.iter().enumerate() {
            let header: [u32; 3] = [if g == 0 { 1 } else { 0 }, 1, 1];
            self.queue.write_buffer(buf, 0, header.as_bytes());
        }
    }

    /// Writes the root region into slot 0 of generation 0
    pub fn set_root_region(&self, region: &Region) {
        let words = region.words(self.kind);
        self.queue.write_buffer(
            &self.buffers[0],
            REGION_HEADER_SIZE,
            words.as_slice().as_bytes(),
        );
    }
}
