// Flat record encoding for queued commands: timestamp, command tag, length-prefixed args.
use std::time::{SystemTime, UNIX_EPOCH};

use crate::core::command::CommandKind;
use crate::core::error::{Error, ErrorKind};

/// Keys must be strictly shorter than this.
pub const MAX_KEY_LEN: usize = 32;
/// Upper bound on argv including the command name.
pub const MAX_CMD_ARGV: usize = 1024;
/// Default ceiling for one encoded record.
pub const MAX_PERSISTENCE_BUF_SIZE: usize = 10240;

const TIMESTAMP_LEN: usize = 4;
const TAG_LEN: usize = 4;
const ARG_LEN: usize = 4;
pub const JOB_HEADER_LEN: usize = TIMESTAMP_LEN + TAG_LEN;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistedJob<'a> {
    /// Unix seconds at enqueue time.
    pub timestamp: u32,
    pub command: CommandKind,
    pub args: Vec<&'a [u8]>,
}

impl<'a> PersistedJob<'a> {
    pub fn key(&self) -> &'a [u8] {
        self.args[0]
    }

    /// Arguments after the key.
    pub fn values(&self) -> &[&'a [u8]] {
        &self.args[1..]
    }
}

pub fn unix_timestamp() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs() as u32)
        .unwrap_or_default()
}

/// Encodes a command into `out`, replacing its contents; returns the record length.
pub fn pack<A: AsRef<[u8]>>(
    command: CommandKind,
    timestamp: u32,
    args: &[A],
    max_record_size: usize,
    out: &mut Vec<u8>,
) -> Result<usize, Error> {
    if args.len() + 1 >= MAX_CMD_ARGV {
        return Err(Error::new(ErrorKind::ArgcOverflow)
            .with_message(format!("{} arguments (max {})", args.len(), MAX_CMD_ARGV - 2)));
    }
    let Some(key) = args.first() else {
        return Err(Error::new(ErrorKind::Usage).with_message(format!("{command} without a key")));
    };
    if !command.arity().accepts(args.len()) {
        return Err(Error::new(ErrorKind::UnsupportedCommand)
            .with_message(format!("{command} with {} arguments is not persisted", args.len())));
    }
    if key.as_ref().len() >= MAX_KEY_LEN {
        return Err(Error::new(ErrorKind::KeySizeExceeded)
            .with_message(format!("key of {} bytes (max {})", key.as_ref().len(), MAX_KEY_LEN - 1)));
    }

    out.clear();
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(&command.tag().to_le_bytes());
    for arg in args {
        let arg = arg.as_ref();
        if out.len() + ARG_LEN + arg.len() >= max_record_size {
            out.clear();
            return Err(Error::new(ErrorKind::SizeOverflow)
                .with_message(format!("{command} record exceeds {max_record_size} bytes")));
        }
        out.extend_from_slice(&(arg.len() as u32).to_le_bytes());
        out.extend_from_slice(arg);
    }
    Ok(out.len())
}

/// Decodes a record produced by [`pack`]. Any inconsistency is corruption.
pub fn unpack(buf: &[u8]) -> Result<PersistedJob<'_>, Error> {
    if buf.len() < JOB_HEADER_LEN {
        return Err(Error::new(ErrorKind::Corrupt).with_message("job record too short"));
    }
    let timestamp = read_u32(buf, 0);
    let tag = read_u32(buf, TIMESTAMP_LEN);
    let command = CommandKind::from_tag(tag).ok_or_else(|| {
        Error::new(ErrorKind::Corrupt).with_message(format!("unknown command tag {tag}"))
    })?;

    let mut args = Vec::new();
    let mut pos = JOB_HEADER_LEN;
    while pos < buf.len() {
        if pos + ARG_LEN > buf.len() {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("truncated argument length")
                .with_offset(pos as u64));
        }
        let len = read_u32(buf, pos) as usize;
        let start = pos + ARG_LEN;
        if len > buf.len() - start {
            return Err(Error::new(ErrorKind::Corrupt)
                .with_message("argument runs past record end")
                .with_offset(pos as u64));
        }
        args.push(&buf[start..start + len]);
        if args.len() > MAX_CMD_ARGV {
            return Err(Error::new(ErrorKind::Corrupt).with_message("argument count exceeds bound"));
        }
        pos = start + len;
    }
    if args.is_empty() {
        return Err(Error::new(ErrorKind::Corrupt).with_message("job record without a key"));
    }

    Ok(PersistedJob {
        timestamp,
        command,
        args,
    })
}

/// Reads only the key of a packed record.
pub fn peek_key(buf: &[u8]) -> Result<&[u8], Error> {
    let start = JOB_HEADER_LEN + ARG_LEN;
    if buf.len() < start {
        return Err(Error::new(ErrorKind::Corrupt).with_message("job record without a key"));
    }
    let len = read_u32(buf, JOB_HEADER_LEN) as usize;
    if len > buf.len() - start {
        return Err(Error::new(ErrorKind::Corrupt)
            .with_message("key runs past record end")
            .with_offset(JOB_HEADER_LEN as u64));
    }
    Ok(&buf[start..start + len])
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(out)
}
