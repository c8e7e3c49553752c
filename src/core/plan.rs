//! Purpose: Plan record placement in the ring without touching storage.
//! Exports: `plan_push`, `PushPlan`, `wrap_pad`, `grow_target`, `LEN_PREFIX`.
//! Role: Pure arithmetic shared by the producer, the consumer and resize.
//! Invariants: Writer and reader apply the same wrap threshold (one max frame).
//! Invariants: A planned frame never crosses the physical end of the ring.
use crate::core::error::{Error, ErrorKind};
use crate::core::header::next_power_of_two;

/// Width of the little-endian length prefix in front of every record.
pub const LEN_PREFIX: usize = 4;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PushPlan {
    /// Tail bytes skipped before the frame (becomes `dirty_size` when non-zero).
    pub pad: usize,
    /// Physical offset of the length prefix.
    pub offset: usize,
    pub frame_len: usize,
    /// False when placing the frame would overwrite unread bytes.
    pub fits: bool,
}

impl PushPlan {
    /// Write counter after the frame is published.
    pub fn next_write_count(&self, write_count: u64) -> u64 {
        write_count + (self.pad + self.frame_len) as u64
    }
}

/// Records need at least one byte, and the length prefix is a `u32`.
pub fn check_max_record_size(max_record_size: usize) -> Result<(), Error> {
    if max_record_size < 2 || max_record_size > u32::MAX as usize {
        return Err(Error::new(ErrorKind::Usage).with_message(format!(
            "max_record_size {max_record_size} out of range (2..={})",
            u32::MAX
        )));
    }
    Ok(())
}

/// Largest frame the ring ever reserves at one offset.
pub fn frame_reserve(max_record_size: usize) -> usize {
    max_record_size + LEN_PREFIX
}

/// Smallest capacity that can hold two maximum frames.
pub fn min_capacity(max_record_size: usize) -> usize {
    next_power_of_two(2 * frame_reserve(max_record_size))
}

pub fn physical_offset(counter: u64, capacity: usize) -> usize {
    (counter & (capacity as u64 - 1)) as usize
}

/// Bytes to skip at `counter` so the next frame starts at offset 0, or 0 when
/// a maximum frame still fits before the physical end.
pub fn wrap_pad(counter: u64, capacity: usize, max_record_size: usize) -> usize {
    let offset = physical_offset(counter, capacity);
    if offset + frame_reserve(max_record_size) > capacity {
        capacity - offset
    } else {
        0
    }
}

pub fn plan_push(
    write_count: u64,
    read_count: u64,
    capacity: usize,
    max_record_size: usize,
    payload_len: usize,
) -> Result<PushPlan, Error> {
    if payload_len == 0 || payload_len >= max_record_size {
        return Err(Error::new(ErrorKind::SizeOverflow)
            .with_message(format!(
                "record of {payload_len} bytes (max {})",
                max_record_size - 1
            )));
    }
    if read_count > write_count {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("read counter is ahead of write counter")
            .with_offset(read_count));
    }

    let pad = wrap_pad(write_count, capacity, max_record_size);
    let offset = if pad > 0 {
        0
    } else {
        physical_offset(write_count, capacity)
    };
    let frame_len = payload_len + LEN_PREFIX;
    let used = (write_count - read_count) as usize;
    let fits = used + pad + frame_len <= capacity;

    Ok(PushPlan {
        pad,
        offset,
        frame_len,
        fits,
    })
}

/// Capacity to grow to: at least double, at least `requested`, power of two.
pub fn grow_target(capacity: usize, requested: usize) -> usize {
    next_power_of_two(capacity.saturating_mul(2).max(requested))
}

#[cfg(test)]
mod tests {
    use super::{check_max_record_size, grow_target, min_capacity, plan_push, wrap_pad};
    use crate::core::error::ErrorKind;

    #[test]
    fn first_frames_are_contiguous() {
        let plan = plan_push(0, 0, 64, 16, 10).expect("plan");
        assert_eq!(plan.pad, 0);
        assert_eq!(plan.offset, 0);
        assert_eq!(plan.frame_len, 14);
        assert!(plan.fits);
        assert_eq!(plan.next_write_count(0), 14);

        let plan = plan_push(42, 0, 64, 16, 10).expect("plan");
        assert_eq!(plan.offset, 42);
        assert!(plan.fits);
    }

    #[test]
    fn tail_inside_wrap_zone_is_padded() {
        let plan = plan_push(56, 42, 64, 16, 10).expect("plan");
        assert_eq!(plan.pad, 8);
        assert_eq!(plan.offset, 0);
        assert!(plan.fits);
        assert_eq!(plan.next_write_count(56), 78);
    }

    #[test]
    fn full_ring_does_not_fit() {
        let plan = plan_push(56, 0, 64, 16, 10).expect("plan");
        assert!(!plan.fits);
    }

    #[test]
    fn oversize_and_empty_records_overflow() {
        let err = plan_push(0, 0, 64, 16, 16).expect_err("too big");
        assert_eq!(err.kind(), ErrorKind::SizeOverflow);
        let err = plan_push(0, 0, 64, 16, 0).expect_err("empty");
        assert_eq!(err.kind(), ErrorKind::SizeOverflow);
        plan_push(0, 0, 64, 16, 15).expect("largest allowed");
    }

    #[test]
    fn wrap_pad_uses_counter_modulo_capacity() {
        assert_eq!(wrap_pad(64 + 56, 64, 16), 8);
        assert_eq!(wrap_pad(64 + 40, 64, 16), 0);
        assert_eq!(wrap_pad(64 + 45, 64, 16), 19);
    }

    #[test]
    fn record_size_limit_bounds() {
        check_max_record_size(2).expect("smallest");
        check_max_record_size(u32::MAX as usize).expect("largest");
        for bad in [0, 1, u32::MAX as usize + 1, usize::MAX] {
            let err = check_max_record_size(bad).expect_err("out of range");
            assert_eq!(err.kind(), ErrorKind::Usage);
        }
    }

    #[test]
    fn growth_doubles_to_power_of_two() {
        assert_eq!(grow_target(64, 0), 128);
        assert_eq!(grow_target(64, 300), 512);
        assert_eq!(min_capacity(16), 64);
        assert_eq!(min_capacity(10240), 32768);
    }
}
