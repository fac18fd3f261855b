//! A small byte-addressable arena shared by every pipeline component.
//!
//! Decoders, mixers, resamplers and the loudness analyzer all hand buffers to each other as
//! "handle + byte length" pairs instead of owning `Vec`s directly. That keeps ownership explicit:
//! - whoever calls `alloc` owns the handle and is the only one allowed to `free` it
//! - a transform that relocates its output returns a *new* `Span` rather than mutating the input
//! - stale handles (freed, then reused slot) are caught by a generation counter
//!
//! Storage is backed by `u64` words so typed views (`i16`, `u8`) via `bytemuck` never hit an
//! alignment error.

use crate::error::{Error, Result};

const WORD_BYTES: usize = std::mem::size_of::<u64>();

/// Stable reference to an arena allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    index: u32,
    generation: u32,
}

/// A view into an allocation: the handle plus how many bytes of it are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub handle: BufferHandle,
    pub byte_length: usize,
}

impl Span {
    pub fn new(handle: BufferHandle, byte_length: usize) -> Self {
        Self {
            handle,
            byte_length,
        }
    }

    /// Number of `i16` samples covered by this span.
    pub fn sample_len(&self) -> usize {
        self.byte_length / std::mem::size_of::<i16>()
    }

    /// Number of interleaved audio frames covered by this span.
    pub fn frame_len(&self, channel_count: usize) -> usize {
        self.sample_len() / channel_count.max(1)
    }
}

#[derive(Debug, Default)]
struct Slot {
    words: Vec<u64>,
    byte_capacity: usize,
    generation: u32,
    live: bool,
}

/// The shared memory space.
#[derive(Debug, Default)]
pub struct SampleArena {
    slots: Vec<Slot>,
    free_slots: Vec<usize>,
}

impl SampleArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed buffer of `byte_capacity` bytes.
    pub fn alloc(&mut self, byte_capacity: usize) -> BufferHandle {
        let words = vec![0u64; byte_capacity.div_ceil(WORD_BYTES)];

        if let Some(index) = self.free_slots.pop() {
            let slot = &mut self.slots[index];
            slot.words = words;
            slot.byte_capacity = byte_capacity;
            slot.generation = slot.generation.wrapping_add(1);
            slot.live = true;
            return BufferHandle {
                index: index as u32,
                generation: slot.generation,
            };
        }

        self.slots.push(Slot {
            words,
            byte_capacity,
            generation: 0,
            live: true,
        });
        BufferHandle {
            index: (self.slots.len() - 1) as u32,
            generation: 0,
        }
    }

    /// Grow (never shrink) an allocation so it holds at least `byte_capacity` bytes.
    ///
    /// Existing contents are preserved.
    pub fn ensure_capacity(&mut self, handle: BufferHandle, byte_capacity: usize) -> Result<()> {
        let slot = self.slot_mut(handle)?;
        if slot.byte_capacity >= byte_capacity {
            return Ok(());
        }
        slot.words.resize(byte_capacity.div_ceil(WORD_BYTES), 0);
        slot.byte_capacity = byte_capacity;
        Ok(())
    }

    /// Release an allocation. Freeing twice, or freeing a stale handle, is a caller bug.
    pub fn free(&mut self, handle: BufferHandle) -> Result<()> {
        let index = handle.index as usize;
        let slot = self.slot_mut(handle)?;
        slot.live = false;
        slot.words = Vec::new();
        slot.byte_capacity = 0;
        self.free_slots.push(index);
        Ok(())
    }

    pub fn capacity(&self, handle: BufferHandle) -> Result<usize> {
        Ok(self.slot(handle)?.byte_capacity)
    }

    /// Number of live allocations (useful for leak checks in tests).
    pub fn live_allocations(&self) -> usize {
        self.slots.iter().filter(|s| s.live).count()
    }

    pub fn bytes(&self, span: Span) -> Result<&[u8]> {
        let slot = self.slot(span.handle)?;
        check_len(span, slot.byte_capacity)?;
        let bytes: &[u8] = bytemuck::cast_slice(&slot.words);
        Ok(&bytes[..span.byte_length])
    }

    pub fn bytes_mut(&mut self, span: Span) -> Result<&mut [u8]> {
        let slot = self.slot_mut(span.handle)?;
        check_len(span, slot.byte_capacity)?;
        let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut slot.words);
        Ok(&mut bytes[..span.byte_length])
    }

    pub fn samples(&self, span: Span) -> Result<&[i16]> {
        let slot = self.slot(span.handle)?;
        check_len(span, slot.byte_capacity)?;
        let samples: &[i16] = bytemuck::cast_slice(&slot.words);
        Ok(&samples[..span.sample_len()])
    }

    pub fn samples_mut(&mut self, span: Span) -> Result<&mut [i16]> {
        let slot = self.slot_mut(span.handle)?;
        check_len(span, slot.byte_capacity)?;
        let samples: &mut [i16] = bytemuck::cast_slice_mut(&mut slot.words);
        Ok(&mut samples[..span.sample_len()])
    }

    /// Read `src` and write `dst` in one step.
    ///
    /// `dst` is grown to `dst_byte_length` first. `src` and `dst` must be different
    /// allocations; the closure receives `i16` views of both.
    pub fn transform<T>(
        &mut self,
        src: Span,
        dst: BufferHandle,
        dst_byte_length: usize,
        f: impl FnOnce(&[i16], &mut [i16]) -> T,
    ) -> Result<(Span, T)> {
        if src.handle == dst {
            return Err(Error::programmer(
                "arena transform source and destination must differ",
            ));
        }
        self.ensure_capacity(dst, dst_byte_length)?;

        // Temporarily take the destination words out so both views can coexist.
        let mut dst_words = std::mem::take(&mut self.slot_mut(dst)?.words);
        let result = self.samples(src).map(|input| {
            let output: &mut [i16] = bytemuck::cast_slice_mut(&mut dst_words);
            f(input, &mut output[..dst_byte_length / std::mem::size_of::<i16>()])
        });
        self.slot_mut(dst)?.words = dst_words;

        Ok((Span::new(dst, dst_byte_length), result?))
    }

    fn slot(&self, handle: BufferHandle) -> Result<&Slot> {
        match self.slots.get(handle.index as usize) {
            Some(slot) if slot.live && slot.generation == handle.generation => Ok(slot),
            _ => Err(Error::programmer(format!(
                "invalid or freed arena handle {handle:?}"
            ))),
        }
    }

    fn slot_mut(&mut self, handle: BufferHandle) -> Result<&mut Slot> {
        match self.slots.get_mut(handle.index as usize) {
            Some(slot) if slot.live && slot.generation == handle.generation => Ok(slot),
            _ => Err(Error::programmer(format!(
                "invalid or freed arena handle {handle:?}"
            ))),
        }
    }
}

fn check_len(span: Span, byte_capacity: usize) -> Result<()> {
    if span.byte_length > byte_capacity {
        return Err(Error::programmer(format!(
            "span of {} bytes exceeds allocation of {} bytes",
            span.byte_length, byte_capacity
        )));
    }
    Ok(())
}

/// A lazily allocated, grow-only buffer owned by one component.
///
/// Components that relocate their output (mixer, resampler) keep one of these and reuse it
/// across calls.
#[derive(Debug, Default)]
pub struct ScratchBuffer {
    handle: Option<BufferHandle>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a handle with at least `byte_length` bytes, allocating or growing as needed.
    pub fn get(&mut self, arena: &mut SampleArena, byte_length: usize) -> Result<BufferHandle> {
        match self.handle {
            Some(handle) => {
                arena.ensure_capacity(handle, byte_length)?;
                Ok(handle)
            }
            None => {
                let handle = arena.alloc(byte_length);
                self.handle = Some(handle);
                Ok(handle)
            }
        }
    }

    pub fn handle(&self) -> Option<BufferHandle> {
        self.handle
    }

    /// Free the underlying allocation, if any. Safe to call when nothing was allocated.
    pub fn release(&mut self, arena: &mut SampleArena) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            arena.free(handle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_zeroed_typed_views() -> Result<()> {
        let mut arena = SampleArena::new();
        let handle = arena.alloc(6);
        let span = Span::new(handle, 6);

        assert_eq!(arena.samples(span)?, &[0, 0, 0]);
        arena.samples_mut(span)?.copy_from_slice(&[1, -2, 3]);
        assert_eq!(arena.samples(span)?, &[1, -2, 3]);
        assert_eq!(arena.bytes(span)?.len(), 6);
        Ok(())
    }

    #[test]
    fn double_free_is_a_programmer_error() {
        let mut arena = SampleArena::new();
        let handle = arena.alloc(16);
        arena.free(handle).unwrap();

        let err = arena.free(handle).unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[test]
    fn stale_handles_are_rejected_after_slot_reuse() {
        let mut arena = SampleArena::new();
        let first = arena.alloc(8);
        arena.free(first).unwrap();

        let second = arena.alloc(8);
        assert_ne!(first, second);
        assert!(arena.samples(Span::new(first, 8)).is_err());
        assert!(arena.samples(Span::new(second, 8)).is_ok());
    }

    #[test]
    fn ensure_capacity_preserves_contents() -> Result<()> {
        let mut arena = SampleArena::new();
        let handle = arena.alloc(4);
        arena
            .samples_mut(Span::new(handle, 4))?
            .copy_from_slice(&[7, 8]);

        arena.ensure_capacity(handle, 64)?;
        assert_eq!(arena.capacity(handle)?, 64);
        assert_eq!(&arena.samples(Span::new(handle, 64))?[..2], &[7, 8]);
        Ok(())
    }

    #[test]
    fn transform_reads_source_and_writes_destination() -> Result<()> {
        let mut arena = SampleArena::new();
        let src = arena.alloc(4);
        arena.samples_mut(Span::new(src, 4))?.copy_from_slice(&[10, 20]);
        let dst = arena.alloc(0);

        let (out, copied) = arena.transform(Span::new(src, 4), dst, 8, |input, output| {
            for (i, s) in input.iter().enumerate() {
                output[i * 2] = *s;
                output[i * 2 + 1] = *s;
            }
            input.len()
        })?;

        assert_eq!(copied, 2);
        assert_eq!(arena.samples(out)?, &[10, 10, 20, 20]);
        Ok(())
    }

    #[test]
    fn transform_rejects_aliasing() {
        let mut arena = SampleArena::new();
        let handle = arena.alloc(4);
        let err = arena
            .transform(Span::new(handle, 4), handle, 4, |_, _| ())
            .unwrap_err();
        assert!(err.is_programmer_error());
    }

    #[test]
    fn scratch_buffer_release_is_idempotent() -> Result<()> {
        let mut arena = SampleArena::new();
        let mut scratch = ScratchBuffer::new();
        scratch.get(&mut arena, 32)?;
        assert_eq!(arena.live_allocations(), 1);

        scratch.release(&mut arena)?;
        scratch.release(&mut arena)?;
        assert_eq!(arena.live_allocations(), 0);
        Ok(())
    }
}
