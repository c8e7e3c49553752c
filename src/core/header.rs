//! Purpose: Encode and validate the durable ring header stored at file offset 0.
//! Exports: `RingHeader`, `HEADER_SIZE`, field offsets used for write-through.
//! Role: Single source of truth for the queue file layout.
//! Invariants: `read_count <= write_count` and the gap never exceeds capacity.
//! Invariants: Capacity is a power of two; file length is `HEADER_SIZE + capacity`.
use crate::core::error::{Error, ErrorKind};

/// `{write_count: u64, read_count: u64, dirty_size: i32, resize_mark: u32}`.
pub const HEADER_SIZE: usize = 24;

pub(crate) const WRITE_COUNT_OFFSET: usize = 0;
pub(crate) const READ_COUNT_OFFSET: usize = 8;
pub(crate) const DIRTY_SIZE_OFFSET: usize = 16;
/// Non-zero from before a resize touches the file until its header is rewritten.
pub(crate) const RESIZE_MARK_OFFSET: usize = 20;
pub(crate) const RESIZE_IN_PROGRESS: u32 = 1;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RingHeader {
    pub write_count: u64,
    pub read_count: u64,
    pub dirty_size: i32,
}

impl RingHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        write_u64(&mut buf, WRITE_COUNT_OFFSET, self.write_count);
        write_u64(&mut buf, READ_COUNT_OFFSET, self.read_count);
        write_i32(&mut buf, DIRTY_SIZE_OFFSET, self.dirty_size);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        if buf.len() < HEADER_SIZE {
            return Err(Error::new(ErrorKind::Corrupt).with_message("header too small"));
        }
        Ok(Self {
            write_count: read_u64(buf, WRITE_COUNT_OFFSET),
            read_count: read_u64(buf, READ_COUNT_OFFSET),
            dirty_size: read_i32(buf, DIRTY_SIZE_OFFSET),
        })
    }

    pub fn outstanding(&self) -> u64 {
        self.write_count.saturating_sub(self.read_count)
    }

    pub fn validate(&self, capacity: usize) -> Result<(), Error> {
        if !capacity.is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("capacity is not a power of two"));
        }
        if self.read_count > self.write_count {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("read counter is ahead of write counter")
                .with_offset(self.read_count));
        }
        if self.write_count - self.read_count > capacity as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("unread bytes exceed capacity")
                .with_offset(self.write_count));
        }
        if self.dirty_size < 0 || self.dirty_size as usize >= capacity {
            return Err(Error::new(ErrorKind::Corrupt).with_message("dirty size out of range"));
        }
        Ok(())
    }
}

/// True when the file was left between the start and the end of a resize.
pub fn resize_interrupted(buf: &[u8]) -> bool {
    buf.len() >= HEADER_SIZE && read_u32(buf, RESIZE_MARK_OFFSET) != 0
}

/// Rounds up to the next power of two; `0` and `1` become `1`.
pub fn next_power_of_two(value: usize) -> usize {
    value.max(1).next_power_of_two()
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(out)
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn read_i32(buf: &[u8], offset: usize) -> i32 {
    read_u32(buf, offset) as i32
}

fn write_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn write_i32(buf: &mut [u8], offset: usize, value: i32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::{
        HEADER_SIZE, RESIZE_IN_PROGRESS, RESIZE_MARK_OFFSET, RingHeader, next_power_of_two,
        resize_interrupted,
    };
    use crate::core::error::ErrorKind;

    #[test]
    fn header_round_trip() {
        let header = RingHeader {
            write_count: 4_000_000_123,
            read_count: 3_999_999_000,
            dirty_size: 12,
        };
        let buf = header.encode();
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(RingHeader::decode(&buf).expect("decode"), header);
    }

    #[test]
    fn crossed_counters_are_corrupt() {
        let header = RingHeader {
            write_count: 10,
            read_count: 11,
            dirty_size: 0,
        };
        let err = header.validate(64).expect_err("crossed");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn overfull_ring_is_corrupt() {
        let header = RingHeader {
            write_count: 200,
            read_count: 100,
            dirty_size: 0,
        };
        assert_eq!(header.validate(64).expect_err("overfull").kind(), ErrorKind::Corrupt);
        header.validate(128).expect("fits");
    }

    #[test]
    fn short_buffer_is_rejected() {
        let err = RingHeader::decode(&[0u8; 8]).expect_err("short");
        assert_eq!(err.kind(), ErrorKind::Corrupt);
    }

    #[test]
    fn encoded_header_has_no_resize_mark() {
        let mut buf = RingHeader::default().encode();
        assert!(!resize_interrupted(&buf));
        buf[RESIZE_MARK_OFFSET..].copy_from_slice(&RESIZE_IN_PROGRESS.to_le_bytes());
        assert!(resize_interrupted(&buf));
        assert!(!resize_interrupted(&buf[..8]));
    }

    #[test]
    fn power_of_two_rounding() {
        assert_eq!(next_power_of_two(0), 1);
        assert_eq!(next_power_of_two(64), 64);
        assert_eq!(next_power_of_two(65), 128);
        assert_eq!(next_power_of_two(1000), 1024);
    }
}
