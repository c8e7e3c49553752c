//! Purpose: Durable single-producer/single-consumer byte ring with online growth.
//! Exports: `open`, `RingOptions`, `Producer`, `Consumer`, `Job`, `RingMonitor`, `RingSnapshot`.
//! Role: The write-behind job queue; optionally mmap-backed so backlog survives restarts.
//! Invariants: Exactly one `Producer` and one `Consumer` exist per ring.
//! Invariants: `read_count <= write_count <= read_count + capacity` in every reachable state.
//! Invariants: Resize runs only on the consumer, only while the producer is parked on the flag.
use std::cell::UnsafeCell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use fs2::FileExt;
use libc::{EACCES, EPERM};
use memmap2::MmapMut;

use crate::core::backlog::{Backlog, RingView, Step};
use crate::core::error::{Error, ErrorKind};
use crate::core::header::{
    DIRTY_SIZE_OFFSET, HEADER_SIZE, READ_COUNT_OFFSET, RESIZE_IN_PROGRESS, RESIZE_MARK_OFFSET,
    RingHeader, WRITE_COUNT_OFFSET, next_power_of_two, resize_interrupted,
};
use crate::core::notify::{Signal, WaitOutcome};
use crate::core::plan::{self, LEN_PREFIX, grow_target, min_capacity, plan_push};

const RESIZE_IDLE: u8 = 0;
const RESIZE_REQUESTED: u8 = 1;

const DEFAULT_BACKOFF: Duration = Duration::from_millis(1);

#[derive(Clone, Debug)]
pub struct RingOptions {
    /// Capacity hint in bytes; rounded up to a power of two.
    pub capacity: usize,
    /// Records must be strictly shorter than this.
    pub max_record_size: usize,
    /// Backing file; `None` keeps the ring on the heap.
    pub path: Option<PathBuf>,
    /// Upper bound for one producer wait while a resize is pending.
    pub backoff: Duration,
}

impl RingOptions {
    pub fn new(capacity: usize, max_record_size: usize) -> Self {
        Self {
            capacity,
            max_record_size,
            path: None,
            backoff: DEFAULT_BACKOFF,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }
}

enum Storage {
    Mapped {
        path: PathBuf,
        file: File,
        mmap: MmapMut,
    },
    Heap {
        words: Box<[u64]>,
    },
}

struct Region {
    storage: Storage,
    base: *mut u8,
    capacity: usize,
}

impl Region {
    fn heap(capacity: usize) -> Self {
        let mut words = vec![0u64; (HEADER_SIZE + capacity).div_ceil(8)].into_boxed_slice();
        let base = words.as_mut_ptr().cast::<u8>();
        Self {
            storage: Storage::Heap { words },
            base,
            capacity,
        }
    }

    fn path(&self) -> Option<&Path> {
        match &self.storage {
            Storage::Mapped { path, .. } => Some(path),
            Storage::Heap { .. } => None,
        }
    }

    fn ring_ptr(&self) -> *mut u8 {
        unsafe { self.base.add(HEADER_SIZE) }
    }

    /// Writes one header field through to storage. Each field has one owning role.
    fn store_field(&self, offset: usize, bytes: &[u8]) {
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), bytes.len());
        }
    }

    fn grow(&mut self, capacity: usize) -> Result<(), Error> {
        match &mut self.storage {
            Storage::Mapped { path, file, mmap } => {
                let old_len = (HEADER_SIZE + self.capacity) as u64;
                file.set_len((HEADER_SIZE + capacity) as u64)
                    .map_err(|err| Error::new(ErrorKind::Io).with_path(&*path).with_source(err))?;
                let mut grown = match unsafe { MmapMut::map_mut(&*file) } {
                    Ok(grown) => grown,
                    Err(err) => {
                        let _ = file.set_len(old_len);
                        return Err(Error::new(ErrorKind::Io)
                            .with_message("failed to remap grown queue file")
                            .with_path(&*path)
                            .with_source(err));
                    }
                };
                self.base = grown.as_mut_ptr();
                *mmap = grown;
            }
            Storage::Heap { words } => {
                let mut grown = vec![0u64; (HEADER_SIZE + capacity).div_ceil(8)].into_boxed_slice();
                self.base = grown.as_mut_ptr().cast::<u8>();
                *words = grown;
            }
        }
        self.capacity = capacity;
        Ok(())
    }

    fn sync(&self) -> Result<(), Error> {
        if let Storage::Mapped { path, mmap, .. } = &self.storage {
            mmap.flush()
                .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        }
        Ok(())
    }
}

struct Shared {
    region: UnsafeCell<Region>,
    write_count: AtomicU64,
    read_count: AtomicU64,
    dirty_size: AtomicU32,
    capacity: AtomicUsize,
    /// Odd while a resize is rewriting the counters.
    generation: AtomicU64,
    max_record_size: usize,
    backoff: Duration,
    resize: AtomicU8,
    resize_target: AtomicUsize,
    pending_frame: AtomicUsize,
    consumer_closed: AtomicBool,
    data_ready: Signal,
    resized: Signal,
}

// The region is only reached through the producer/consumer protocol above:
// disjoint byte ranges on the data path, exclusive consumer access during resize.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    /// # Safety
    /// Must not overlap with the consumer's exclusive access during resize.
    unsafe fn region(&self) -> &Region {
        unsafe { &*self.region.get() }
    }

    fn snapshot(&self) -> RingSnapshot {
        loop {
            let before = self.generation.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::thread::yield_now();
                continue;
            }
            let read_count = self.read_count.load(Ordering::Acquire);
            let write_count = self.write_count.load(Ordering::Acquire);
            let dirty_size = self.dirty_size.load(Ordering::Acquire);
            let capacity = self.capacity.load(Ordering::Acquire);
            if self.generation.load(Ordering::Acquire) == before {
                return RingSnapshot {
                    write_count,
                    read_count,
                    dirty_size,
                    capacity,
                };
            }
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RingSnapshot {
    pub write_count: u64,
    pub read_count: u64,
    pub dirty_size: u32,
    pub capacity: usize,
}

impl RingSnapshot {
    pub fn outstanding(&self) -> u64 {
        self.write_count.saturating_sub(self.read_count)
    }
}

/// Read-only observer that may live on any thread.
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<Shared>,
}

impl RingMonitor {
    pub fn snapshot(&self) -> RingSnapshot {
        self.shared.snapshot()
    }

    /// True while the producer is parked waiting for the consumer to grow the ring.
    pub fn resize_pending(&self) -> bool {
        self.shared.resize.load(Ordering::Acquire) == RESIZE_REQUESTED
    }
}

/// Opens (or creates) a ring and splits it into its two endpoints.
pub fn open(options: RingOptions) -> Result<(Producer, Consumer), Error> {
    plan::check_max_record_size(options.max_record_size)?;
    let requested = next_power_of_two(options.capacity).max(min_capacity(options.max_record_size));

    let (region, header) = match &options.path {
        Some(path) => open_mapped(path, requested)?,
        None => (Region::heap(requested), RingHeader::default()),
    };
    if let Err(err) = header.validate(region.capacity) {
        return Err(match region.path() {
            Some(path) => err.with_path(path),
            None => err,
        });
    }
    tracing::info!(
        path = ?region.path(),
        write_count = header.write_count,
        read_count = header.read_count,
        dirty_size = header.dirty_size,
        capacity = region.capacity,
        "write-behind ring opened"
    );

    let capacity = region.capacity;
    let shared = Arc::new(Shared {
        region: UnsafeCell::new(region),
        write_count: AtomicU64::new(header.write_count),
        read_count: AtomicU64::new(header.read_count),
        dirty_size: AtomicU32::new(header.dirty_size as u32),
        capacity: AtomicUsize::new(capacity),
        generation: AtomicU64::new(0),
        max_record_size: options.max_record_size,
        backoff: options.backoff,
        resize: AtomicU8::new(RESIZE_IDLE),
        resize_target: AtomicUsize::new(0),
        pending_frame: AtomicUsize::new(0),
        consumer_closed: AtomicBool::new(false),
        data_ready: Signal::new(),
        resized: Signal::new(),
    });

    let mut consumer = Consumer {
        shared: Arc::clone(&shared),
    };
    if requested > capacity {
        consumer.resize_now(requested)?;
    }
    Ok((Producer { shared }, consumer))
}

fn open_mapped(path: &Path, requested: usize) -> Result<(Region, RingHeader), Error> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

    file.try_lock_exclusive().map_err(|err| {
        Error::new(lock_error_kind(&err))
            .with_message("queue file is already open")
            .with_path(path)
            .with_source(err)
    })?;

    let actual_size = file
        .metadata()
        .map(|meta| meta.len())
        .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;

    let fresh = actual_size == 0;
    let capacity = if fresh {
        file.set_len((HEADER_SIZE + requested) as u64)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?;
        requested
    } else {
        if actual_size <= HEADER_SIZE as u64 {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("queue file shorter than its header")
                .with_path(path));
        }
        let capacity = (actual_size - HEADER_SIZE as u64) as usize;
        if !capacity.is_power_of_two() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("queue capacity is not a power of two")
                .with_path(path));
        }
        capacity
    };

    let mut mmap = unsafe {
        MmapMut::map_mut(&file)
            .map_err(|err| Error::new(ErrorKind::Io).with_path(path).with_source(err))?
    };
    let header = if fresh {
        RingHeader::default()
    } else {
        if resize_interrupted(&mmap[..HEADER_SIZE]) {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("queue file was left in the middle of a resize")
                .with_hint("Move the file aside to start with an empty queue.")
                .with_path(path));
        }
        RingHeader::decode(&mmap[..HEADER_SIZE]).map_err(|err| err.with_path(path))?
    };

    let base = mmap.as_mut_ptr();
    Ok((
        Region {
            storage: Storage::Mapped {
                path: path.to_path_buf(),
                file,
                mmap,
            },
            base,
            capacity,
        },
        header,
    ))
}

fn lock_error_kind(err: &io::Error) -> ErrorKind {
    let errno = err.raw_os_error().unwrap_or_default();
    if errno == EACCES || errno == EPERM {
        return ErrorKind::Permission;
    }
    match err.kind() {
        io::ErrorKind::WouldBlock => ErrorKind::Busy,
        io::ErrorKind::PermissionDenied => ErrorKind::Permission,
        _ => ErrorKind::Io,
    }
}

/// Push side. The ring assumes one pusher; `&mut self` keeps it that way.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Appends one record, blocking while the consumer grows a full ring.
    pub fn push(&mut self, payload: &[u8]) -> Result<(), Error> {
        let shared = &*self.shared;
        loop {
            let capacity = shared.capacity.load(Ordering::Acquire);
            let write_count = shared.write_count.load(Ordering::Relaxed);
            let read_count = shared.read_count.load(Ordering::Acquire);
            let plan = plan_push(
                write_count,
                read_count,
                capacity,
                shared.max_record_size,
                payload.len(),
            )?;
            if !plan.fits {
                self.wait_for_resize(grow_target(capacity, 0), plan.frame_len)?;
                continue;
            }

            let region = unsafe { shared.region() };
            unsafe {
                let dst = region.ring_ptr().add(plan.offset);
                let len = (payload.len() as u32).to_le_bytes();
                ptr::copy_nonoverlapping(len.as_ptr(), dst, LEN_PREFIX);
                ptr::copy_nonoverlapping(payload.as_ptr(), dst.add(LEN_PREFIX), payload.len());
            }
            if plan.pad > 0 {
                let pad = plan.pad as u32;
                region.store_field(DIRTY_SIZE_OFFSET, &pad.to_le_bytes());
                shared.dirty_size.store(pad, Ordering::Relaxed);
            }
            let next = plan.next_write_count(write_count);
            region.store_field(WRITE_COUNT_OFFSET, &next.to_le_bytes());
            shared.write_count.store(next, Ordering::Release);
            shared.data_ready.post();

            tracing::trace!(write_count = next, len = payload.len(), pad = plan.pad, "ring push");
            return Ok(());
        }
    }

    /// Grows the ring to at least `capacity` bytes, blocking until the consumer has done it.
    pub fn grow(&mut self, capacity: usize) -> Result<(), Error> {
        let current = self.shared.capacity.load(Ordering::Acquire);
        if capacity <= current {
            return Ok(());
        }
        self.wait_for_resize(grow_target(current, capacity), 0)
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    fn wait_for_resize(&self, target: usize, pending_frame: usize) -> Result<(), Error> {
        let shared = &*self.shared;
        debug_assert_eq!(shared.resize.load(Ordering::Relaxed), RESIZE_IDLE);
        shared.resize_target.store(target, Ordering::Relaxed);
        shared.pending_frame.store(pending_frame, Ordering::Relaxed);
        shared.resize.store(RESIZE_REQUESTED, Ordering::Release);
        tracing::warn!(
            write_count = shared.write_count.load(Ordering::Relaxed),
            read_count = shared.read_count.load(Ordering::Relaxed),
            target,
            "ring resize requested"
        );
        shared.data_ready.post();

        while shared.resize.load(Ordering::Acquire) == RESIZE_REQUESTED {
            if shared.consumer_closed.load(Ordering::Acquire) {
                shared.resize.store(RESIZE_IDLE, Ordering::Release);
                return Err(Error::new(ErrorKind::Internal)
                    .with_message("ring consumer closed while a resize was pending"));
            }
            shared.resized.wait(shared.backoff);
        }
        Ok(())
    }
}

/// Pop side; the only place a resize is carried out.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Peeks the oldest record. Dropping the returned job advances past it.
    pub fn pop(&mut self) -> Result<Option<Job<'_>>, Error> {
        if self.shared.resize.load(Ordering::Acquire) == RESIZE_REQUESTED {
            self.complete_resize()?;
        }

        let shared = &*self.shared;
        let mut read_count = shared.read_count.load(Ordering::Relaxed);
        let write_count = shared.write_count.load(Ordering::Acquire);
        if read_count > write_count {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("read counter is ahead of write counter")
                .with_offset(read_count));
        }
        if read_count == write_count {
            return Ok(None);
        }

        let view = self.view();
        let len = match unsafe { view.step(read_count, write_count) }? {
            Step::Pad(pad) => {
                read_count += pad as u64;
                self.store_read_count(read_count);
                if read_count == write_count {
                    return Ok(None);
                }
                match unsafe { view.step(read_count, write_count) }? {
                    Step::Frame(len) => len,
                    Step::Pad(_) => {
                        return Err(Error::new(ErrorKind::Corrupt)
                            .with_message("consecutive wrap padding")
                            .with_offset(read_count));
                    }
                }
            }
            Step::Frame(len) => len,
        };

        let payload = unsafe { view.payload(read_count, len) };
        tracing::trace!(read_count, len, "ring pop");
        Ok(Some(Job {
            shared,
            payload,
            next_read_count: read_count + (len + LEN_PREFIX) as u64,
        }))
    }

    /// Unread records in order, without consuming them.
    pub fn backlog(&self) -> Backlog<'_> {
        let read_count = self.shared.read_count.load(Ordering::Relaxed);
        let write_count = self.shared.write_count.load(Ordering::Acquire);
        unsafe { Backlog::new(self.view(), read_count, write_count) }
    }

    /// Bounded wait for the producer to publish data or request a resize.
    pub fn wait_for_data(&self, timeout: Duration) -> WaitOutcome {
        self.shared.data_ready.wait(timeout)
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Flushes a file-backed ring to disk.
    pub fn sync(&self) -> Result<(), Error> {
        unsafe { self.shared.region() }.sync()
    }

    fn view(&self) -> RingView {
        let region = unsafe { self.shared.region() };
        RingView {
            base: region.ring_ptr(),
            capacity: region.capacity,
            max_record_size: self.shared.max_record_size,
            dirty_size: self.shared.dirty_size.load(Ordering::Acquire) as usize,
        }
    }

    fn store_read_count(&self, read_count: u64) {
        let region = unsafe { self.shared.region() };
        region.store_field(READ_COUNT_OFFSET, &read_count.to_le_bytes());
        self.shared.read_count.store(read_count, Ordering::Release);
    }

    fn complete_resize(&mut self) -> Result<(), Error> {
        let shared = Arc::clone(&self.shared);
        let capacity = shared.capacity.load(Ordering::Relaxed);
        let target = shared.resize_target.load(Ordering::Relaxed);
        let pending_frame = shared.pending_frame.load(Ordering::Relaxed);

        let result = if pending_frame > 0 && self.pending_frame_fits(capacity, pending_frame) {
            tracing::info!(capacity, "ring resize deferred, pending record fits");
            Ok(())
        } else {
            self.resize_now(target.max(grow_target(capacity, 0)))
        };

        shared.resize.store(RESIZE_IDLE, Ordering::Release);
        shared.resized.post();
        result
    }

    fn pending_frame_fits(&self, capacity: usize, frame_len: usize) -> bool {
        let shared = &*self.shared;
        let write_count = shared.write_count.load(Ordering::Relaxed);
        let read_count = shared.read_count.load(Ordering::Relaxed);
        let pad = plan::wrap_pad(write_count, capacity, shared.max_record_size);
        (write_count - read_count) as usize + pad + frame_len <= capacity
    }

    /// Linearises the unread frames into a ring of `target` bytes.
    fn resize_now(&mut self, target: usize) -> Result<(), Error> {
        let shared = &*self.shared;
        let old_capacity = shared.capacity.load(Ordering::Relaxed);
        let write_count = shared.write_count.load(Ordering::Relaxed);
        let read_count = shared.read_count.load(Ordering::Relaxed);
        tracing::warn!(write_count, read_count, old_capacity, target, "ring resize start");

        let staged = self.backlog().linearize()?;
        if staged.len() > old_capacity || staged.len() as u64 > write_count - read_count {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message(format!(
                    "resize backup of {} bytes exceeds ring bounds",
                    staged.len()
                ))
                .with_offset(write_count));
        }
        let target = next_power_of_two(target.max(old_capacity));

        shared.generation.fetch_add(1, Ordering::AcqRel);
        let region = unsafe { &mut *shared.region.get() };
        // The mark must be on disk before the file length or any frame changes.
        region.store_field(RESIZE_MARK_OFFSET, &RESIZE_IN_PROGRESS.to_le_bytes());
        let grown = match region.sync() {
            Ok(()) if target > old_capacity => region.grow(target),
            synced => synced,
        };
        if let Err(err) = grown {
            region.store_field(RESIZE_MARK_OFFSET, &0u32.to_le_bytes());
            shared.generation.fetch_add(1, Ordering::AcqRel);
            tracing::error!(error = %err, "ring resize failed, keeping old layout");
            return Err(err);
        }

        unsafe {
            ptr::copy_nonoverlapping(staged.as_ptr(), region.ring_ptr(), staged.len());
        }
        let header = RingHeader {
            write_count: staged.len() as u64,
            read_count: 0,
            dirty_size: 0,
        };
        let encoded = header.encode();
        region.store_field(WRITE_COUNT_OFFSET, &encoded[..RESIZE_MARK_OFFSET]);
        region.store_field(RESIZE_MARK_OFFSET, &0u32.to_le_bytes());
        shared.write_count.store(header.write_count, Ordering::Release);
        shared.read_count.store(0, Ordering::Release);
        shared.dirty_size.store(0, Ordering::Release);
        shared.capacity.store(region.capacity, Ordering::Release);
        shared.generation.fetch_add(1, Ordering::AcqRel);

        tracing::warn!(
            write_count = header.write_count,
            capacity = region.capacity,
            "ring resize complete"
        );
        Ok(())
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.consumer_closed.store(true, Ordering::Release);
        self.shared.resized.post();
    }
}

/// A borrowed record; valid until dropped, which advances the read counter.
pub struct Job<'a> {
    shared: &'a Shared,
    payload: &'a [u8],
    next_read_count: u64,
}

impl Job<'_> {
    pub fn payload(&self) -> &[u8] {
        self.payload
    }

    /// Leaves the record in the ring; the next pop returns it again.
    pub fn unread(self) {
        std::mem::forget(self);
    }
}

impl std::ops::Deref for Job<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.payload
    }
}

impl Drop for Job<'_> {
    fn drop(&mut self) {
        let region = unsafe { self.shared.region() };
        region.store_field(READ_COUNT_OFFSET, &self.next_read_count.to_le_bytes());
        self.shared
            .read_count
            .store(self.next_read_count, Ordering::Release);
    }
}
