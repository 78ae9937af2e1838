//! Aligned sample storage for packet payloads, ring buffers and effect I/O

use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;

/// Alignment of every `AlignedBuffer` (AVX loads want 32 bytes)
pub const BUFFER_ALIGNMENT: usize = 32;

/// Heap buffer with `BUFFER_ALIGNMENT`-aligned start, zeroed at allocation
///
/// The alignment guarantees that byte views can be reinterpreted as `f32` or
/// `i16` slices without copying.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        // Zero-sized layouts are not allowed by the allocator.
        let layout = match Layout::from_size_align(len.max(1), BUFFER_ALIGNMENT) {
            Ok(layout) => layout,
            Err(err) => panic!("invalid buffer layout for {} bytes: {}", len, err),
        };

        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };

        Self { ptr, len, layout }
    }

    /// Allocate a buffer holding a copy of `samples`.
    pub fn from_f32(samples: &[f32]) -> Self {
        let mut buffer = Self::zeroed(std::mem::size_of_val(samples));
        buffer.as_f32_mut().copy_from_slice(samples);
        buffer
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = Self::zeroed(bytes.len());
        buffer.as_bytes_mut().copy_from_slice(bytes);
        buffer
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The buffer as `f32` samples; a trailing partial sample is excluded.
    pub fn as_f32(&self) -> &[f32] {
        let whole = self.len - self.len % 4;
        bytemuck::cast_slice(&self.as_bytes()[..whole])
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        let whole = self.len - self.len % 4;
        bytemuck::cast_slice_mut(&mut self.as_bytes_mut()[..whole])
    }

    pub fn fill(&mut self, byte: u8) {
        self.as_bytes_mut().fill(byte);
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        unsafe {
            dealloc(self.ptr.as_ptr(), self.layout);
        }
    }
}

impl std::fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("len", &self.len)
            .field("align", &self.layout.align())
            .finish()
    }
}

/// Reads `f32` samples from a payload that may not be 4-byte aligned.
pub fn f32_samples(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}
