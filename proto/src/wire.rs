//! On-wire message shapes: command/response headers, the closed command
//! type enum, and the NUL-terminated string block codec used for argv/envp.

use std::convert::TryFrom;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

/// Every message on every socket starts with this fixed header, followed
/// by exactly `datalen` payload bytes.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct CommandHeader {
    pub command_type: u32,
    pub datalen: u64,
}

impl CommandHeader {
    pub const LEN: usize = std::mem::size_of::<Self>();

    pub fn new(command_type: CommandType, datalen: u64) -> Self {
        Self {
            command_type: command_type as u32,
            datalen,
        }
    }
}

/// The closed set of commands exchanged between a client and either the
/// master daemon or a session server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandType {
    /// Master command: create or attach to the caller's session.
    OpenSession = 1,
    /// Master command: terminate the caller's session (idempotent).
    CloseSession = 2,
    /// Session command: start a new task conversation, naming its kind.
    TaskBegin = 3,
    /// Session command: install the task's stdio descriptors.
    TaskFds = 4,
    /// Session command: supply the task's argument vector.
    TaskArguments = 5,
    /// Session command: supply the task's environment vector.
    TaskEnviron = 6,
    /// Session command: run the task and report its exit status.
    TaskRun = 7,
}

impl TryFrom<u32> for CommandType {
    type Error = crate::Error;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::OpenSession,
            2 => Self::CloseSession,
            3 => Self::TaskBegin,
            4 => Self::TaskFds,
            5 => Self::TaskArguments,
            6 => Self::TaskEnviron,
            7 => Self::TaskRun,
            other => return Err(crate::Error::UnknownCommand(other)),
        })
    }
}

/// Response status, sent in a [`ResponseHeader`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Status {
    Done = 0,
    Failed = 1,
}

impl TryFrom<i32> for Status {
    type Error = crate::Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Done),
            1 => Ok(Self::Failed),
            other => Err(crate::Error::Protocol(status_err(other))),
        }
    }
}

fn status_err(_other: i32) -> &'static str {
    "invalid response status"
}

/// Fixed header of every response: `status` plus the length of an optional
/// trailing UTF-8 error message.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct ResponseHeader {
    pub status: i32,
    pub msglen: i64,
}

impl ResponseHeader {
    pub const LEN: usize = std::mem::size_of::<Self>();

    pub fn done() -> Self {
        Self {
            status: Status::Done as i32,
            msglen: 0,
        }
    }

    pub fn failed(msglen: i64) -> Self {
        Self {
            status: Status::Failed as i32,
            msglen,
        }
    }
}

/// Payload of `TASK_BEGIN`: the task kind plus the caller's session index.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct TaskBeginPayload {
    pub task_kind: u32,
    pub caller_num: u32,
}

/// Payload of `OPEN_SESSION`/`CLOSE_SESSION`: the caller-chosen session
/// index. The caller's uid/gid half of the session key comes from
/// `SO_PEERCRED`, never from the payload.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct SessionPayload {
    pub caller_num: u32,
}

/// Concatenate `strings` into a single NUL-terminated block, the wire
/// format used by `TASK_ARGUMENTS`/`TASK_ENVIRON`.
///
/// # Panics
/// Panics if any string contains an embedded NUL byte — such a string could
/// never round-trip through this format.
pub fn encode_strings<S: AsRef<str>>(strings: &[S]) -> Vec<u8> {
    let mut buf = Vec::new();
    for s in strings {
        let s = s.as_ref();
        assert!(!s.as_bytes().contains(&0), "string contains embedded NUL");
        buf.extend_from_slice(s.as_bytes());
        buf.push(0);
    }
    buf
}

/// Reconstruct the string vector from a NUL-terminated block of exactly
/// `datalen` bytes, as sent on the wire.
///
/// Fails if `count` strings cannot be found, or if the final byte of the
/// block is not a NUL terminator (a truncated or malformed block).
pub fn decode_strings(data: &[u8], count: usize) -> Result<Vec<String>, crate::Error> {
    if count == 0 {
        if !data.is_empty() {
            return Err(crate::Error::Protocol("unexpected string block data"));
        }
        return Ok(Vec::new());
    }
    if data.last() != Some(&0) {
        return Err(crate::Error::Protocol("string block not NUL-terminated"));
    }

    let mut result = Vec::with_capacity(count);
    let mut start = 0usize;
    for chunk in data.split(|&b| b == 0) {
        if result.len() == count {
            break;
        }
        // `split` on a NUL-terminated block yields a trailing empty slice
        // for the final separator; skip it once we already matched `count`.
        let s = std::str::from_utf8(chunk)
            .map_err(|_| crate::Error::Protocol("string block is not valid UTF-8"))?;
        result.push(s.to_string());
        start += chunk.len() + 1;
    }
    let _ = start;

    if result.len() != count {
        return Err(crate::Error::Protocol("string block count mismatch"));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_argv_with_no_nuls() {
        let argv = vec!["chroot1".to_string(), "/srv/root".to_string(), "/bin/true".to_string()];
        let encoded = encode_strings(&argv);
        let decoded = decode_strings(&encoded, argv.len()).unwrap();
        assert_eq!(argv, decoded);
    }

    #[test]
    fn round_trips_empty_vector() {
        let argv: Vec<String> = vec![];
        let encoded = encode_strings(&argv);
        assert!(encoded.is_empty());
        let decoded = decode_strings(&encoded, 0).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn rejects_block_missing_trailing_nul() {
        let data = b"foo\0bar".to_vec();
        assert!(decode_strings(&data, 2).is_err());
    }

    #[test]
    fn header_length_matches_wire_layout() {
        // `repr(C)` rounds both headers up to a multiple of the 8-byte
        // alignment of their `u64`/`i64` field.
        assert_eq!(CommandHeader::LEN, 16);
        assert_eq!(ResponseHeader::LEN, 16);
    }
}
