// Walks unread frames between the read and write counters without consuming them.
use std::marker::PhantomData;
use std::ptr;

use crate::core::error::{Error, ErrorKind};
use crate::core::plan::{LEN_PREFIX, physical_offset, wrap_pad};

#[derive(Debug, PartialEq)]
pub struct Frame<'a> {
    /// Write counter at which the frame's length prefix starts.
    pub counter: u64,
    pub payload: &'a [u8],
}

pub(crate) enum Step {
    /// Wrap padding of this many bytes starts at the position.
    Pad(usize),
    /// A frame whose payload has this many bytes starts at the position.
    Frame(usize),
}

/// Geometry of the live ring, copied out so a walk never holds the region.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RingView {
    pub base: *const u8,
    pub capacity: usize,
    pub max_record_size: usize,
    pub dirty_size: usize,
}

impl RingView {
    /// Classifies the bytes at `pos`, which must be below `end`.
    ///
    /// # Safety
    /// `base` must point at `capacity` readable bytes and the frames in
    /// `[pos, end)` must not be written concurrently.
    pub(crate) unsafe fn step(&self, pos: u64, end: u64) -> Result<Step, Error> {
        let pad = wrap_pad(pos, self.capacity, self.max_record_size);
        if pad > 0 {
            if pad != self.dirty_size {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message(format!(
                        "wrap padding {pad} does not match dirty size {}",
                        self.dirty_size
                    ))
                    .with_offset(pos));
            }
            if pos + pad as u64 > end {
                return Err(Error::new(ErrorKind::Corrupt)
                    .with_message("wrap padding runs past write counter")
                    .with_offset(pos));
            }
            return Ok(Step::Pad(pad));
        }

        let offset = physical_offset(pos, self.capacity);
        let mut len_bytes = [0u8; LEN_PREFIX];
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), len_bytes.as_mut_ptr(), LEN_PREFIX);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len == 0 || len >= self.max_record_size {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!("frame length {len} out of range"))
                .with_offset(pos));
        }
        if pos + (len + LEN_PREFIX) as u64 > end {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("frame runs past write counter")
                .with_offset(pos));
        }
        Ok(Step::Frame(len))
    }

    /// # Safety
    /// Same contract as [`RingView::step`]; `pos` must start a frame of `len` bytes.
    pub(crate) unsafe fn payload<'a>(&self, pos: u64, len: usize) -> &'a [u8] {
        let offset = physical_offset(pos, self.capacity) + LEN_PREFIX;
        unsafe { std::slice::from_raw_parts(self.base.add(offset), len) }
    }
}

pub struct Backlog<'a> {
    view: RingView,
    pos: u64,
    end: u64,
    failed: bool,
    _ring: PhantomData<&'a [u8]>,
}

impl<'a> Backlog<'a> {
    /// # Safety
    /// The frames in `[read_count, write_count)` must stay untouched for `'a`.
    pub(crate) unsafe fn new(view: RingView, read_count: u64, write_count: u64) -> Self {
        Self {
            view,
            pos: read_count,
            end: write_count,
            failed: false,
            _ring: PhantomData,
        }
    }

    /// Copies every remaining frame, length prefix included, into one buffer.
    pub fn linearize(self) -> Result<Vec<u8>, Error> {
        let mut staged = Vec::with_capacity((self.end - self.pos) as usize);
        for frame in self {
            let frame = frame?;
            staged.extend_from_slice(&(frame.payload.len() as u32).to_le_bytes());
            staged.extend_from_slice(frame.payload);
        }
        Ok(staged)
    }
}

impl<'a> Iterator for Backlog<'a> {
    type Item = Result<Frame<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.failed && self.pos < self.end {
            match unsafe { self.view.step(self.pos, self.end) } {
                Ok(Step::Pad(pad)) => self.pos += pad as u64,
                Ok(Step::Frame(len)) => {
                    let counter = self.pos;
                    let payload = unsafe { self.view.payload(counter, len) };
                    self.pos += (len + LEN_PREFIX) as u64;
                    return Some(Ok(Frame { counter, payload }));
                }
                Err(err) => {
                    self.failed = true;
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::{Backlog, RingView};
    use crate::core::error::ErrorKind;

    fn put(ring: &mut [u8], offset: usize, payload: &[u8]) {
        ring[offset..offset + 4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        ring[offset + 4..offset + 4 + payload.len()].copy_from_slice(payload);
    }

    fn view(ring: &[u8], dirty_size: usize) -> RingView {
        RingView {
            base: ring.as_ptr(),
            capacity: ring.len(),
            max_record_size: 16,
            dirty_size,
        }
    }

    #[test]
    fn walks_across_wrap_padding() {
        let mut ring = vec![0u8; 64];
        put(&mut ring, 42, b"aaaaaaaaaa");
        put(&mut ring, 0, b"bbbbbbbbbb");

        // 42..56 holds the first frame, 56..64 is padding, 64.. is offset 0.
        let frames: Vec<_> = unsafe { Backlog::new(view(&ring, 8), 42, 78) }
            .map(|frame| frame.expect("frame"))
            .collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].counter, 42);
        assert_eq!(frames[0].payload, b"aaaaaaaaaa");
        assert_eq!(frames[1].counter, 64);
        assert_eq!(frames[1].payload, b"bbbbbbbbbb");
    }

    #[test]
    fn linearize_keeps_length_prefixes() {
        let mut ring = vec![0u8; 64];
        put(&mut ring, 0, b"xy");
        put(&mut ring, 6, b"z");
        let staged = unsafe { Backlog::new(view(&ring, 0), 0, 11) }
            .linearize()
            .expect("linearize");
        assert_eq!(staged, [2, 0, 0, 0, b'x', b'y', 1, 0, 0, 0, b'z']);
    }

    #[test]
    fn mismatched_padding_is_corrupt() {
        let mut ring = vec![0u8; 64];
        put(&mut ring, 0, b"bbbbbbbbbb");
        let mut backlog = unsafe { Backlog::new(view(&ring, 4), 56, 78) };
        let err = backlog.next().expect("item").expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
        assert!(backlog.next().is_none());
    }

    #[test]
    fn zero_length_frame_is_corrupt() {
        let ring = vec![0u8; 64];
        let err = unsafe { Backlog::new(view(&ring, 0), 0, 14) }
            .next()
            .expect("item")
            .expect_err("corrupt");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }
}
