use crate::Error;
use zerocopy::FromBytes;

pub(crate) fn new_buffer(
    device: &wgpu::Device,
    name: &str,
    size: u64,
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(name),
        size,
        usage,
        mapped_at_creation: false,
    })
}

/// Copies a GPU buffer into a `Vec<T>`, with a blocking wait
///
/// The buffer must have been created with `COPY_SRC` usage.
pub fn read_buffer<T: FromBytes + Copy>(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    buf: &wgpu::Buffer,
) -> Result<Vec<T>, Error> {
    let scratch = new_buffer(
        device,
        "read_buffer",
        buf.size(),
        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
    );
    let mut encoder =
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("read_buffer"),
        });
    encoder.copy_buffer_to_buffer(buf, 0, &scratch, 0, buf.size());
    queue.submit(Some(encoder.finish()));

    let bytes = map_and_read(device, &scratch)?;
    Ok(bytes
        .chunks_exact(std::mem::size_of::<T>())
        .filter_map(|c| T::read_from_bytes(c).ok())
        .collect())
}

/// Copies a 4-byte-per-texel texture into tightly packed rows, with a blocking
/// wait
///
/// The texture must have been created with `COPY_SRC` usage.
pub fn read_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    texture: &wgpu::Texture,
) -> Result<Vec<u8>, Error> {
    let (width, height) = (texture.width(), texture.height());
    let row = width * 4;
    let padded_row = row.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
    let scratch = new_buffer(
        device,
        "read_texture",
        padded_row as u64 * height as u64,
        wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
    );
    let mut encoder =
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("read_texture"),
        });
    encoder.copy_texture_to_buffer(
        texture.as_image_copy(),
        wgpu::TexelCopyBufferInfo {
            buffer: &scratch,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_row),
                rows_per_image: Some(height),
            },
        },
        wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
    );
    queue.submit(Some(encoder.finish()));

    let bytes = map_and_read(device, &scratch)?;
    Ok(bytes
        .chunks_exact(padded_row as usize)
        .flat_map(|r| &r[..row as usize])
        .copied()
        .collect())
}

/// Maps a `MAP_READ` buffer and copies out its contents
fn map_and_read(
    device: &wgpu::Device,
    buf: &wgpu::Buffer,
) -> Result<Vec<u8>, Error> {
    let buffer_slice = buf.slice(..);
    buffer_slice.map_async(wgpu::MapMode::Read, |_| {});
    device.poll(wgpu::PollType::wait_indefinitely())?;
    let out = buffer_slice.get_mapped_range().to_vec();
    buf.unmap();
    Ok(out)
}
