//! Task log: the record of sessions, tasks, forks and library loads.
//!
//! Two generations exist inside a data directory:
//!
//! * `task.txt` - one text line per record, appended by every writer
//!   ([`text`], [`writer`]),
//! * `task` - legacy framed binary records ([`binary`]).

pub mod binary;
pub mod text;
pub mod writer;

use std::fmt;

use crate::session::SessionId;

pub use binary::read_task_file;
pub use text::{parse_line, read_task_txt_file, TaskLogEntry};
pub use writer::{write_dlopen_info, write_fork_info, write_session_info, write_task_info};

pub const TASK_TXT_FILE: &str = "task.txt";
pub const TASK_FILE: &str = "task";

pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Upper bound for one appended line. Appends up to this size are a single
/// `write(2)` and are not interleaved with other writers on local
/// filesystems (POSIX `PIPE_BUF` is at least 4096 on Linux).
pub const MAX_LINE_LEN: usize = 4096;

pub(crate) const TAG_TASK: &str = "TASK";
pub(crate) const TAG_FORK: &str = "FORK";
pub(crate) const TAG_SESS: &str = "SESS";
pub(crate) const TAG_DLOP: &str = "DLOP";

/// Task creation or fork completion. For a fork, `pid` is the parent pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskMsg {
    pub time: u64,
    pub pid: i32,
    pub tid: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMsg {
    pub task: TaskMsg,
    pub sid: SessionId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlopenMsg {
    pub task: TaskMsg,
    pub sid: SessionId,
    pub base_addr: u64,
}

/// `sec.nsec` rendering of a nanosecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn parse(text: &str) -> Option<Self> {
        let (sec, nsec) = text.split_once('.')?;
        let sec: u64 = sec.parse().ok()?;
        let nsec: u64 = nsec.parse().ok()?;
        if nsec >= NSEC_PER_SEC {
            return None;
        }
        sec.checked_mul(NSEC_PER_SEC)?.checked_add(nsec).map(Self)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.0 / NSEC_PER_SEC, self.0 % NSEC_PER_SEC)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    #[test]
    fn timestamp__display__then_nanoseconds_zero_padded() {
        assert_eq!(Timestamp(12_000_000_500).to_string(), "12.000000500");
        assert_eq!(Timestamp(0).to_string(), "0.000000000");
    }

    #[test]
    fn timestamp__parse__then_inverse_of_display() {
        assert_eq!(Timestamp::parse("12.000000500"), Some(Timestamp(12_000_000_500)));
        assert_eq!(Timestamp::parse("13.5"), Some(Timestamp(13_000_000_005)));
        assert_eq!(Timestamp::parse("13"), None);
        assert_eq!(Timestamp::parse("1.1000000000"), None);
        assert_eq!(Timestamp::parse("x.1"), None);
    }
}
