// Reader for `task.txt`.
//
// Each line is `<TAG> timestamp=<sec>.<nsec> key=value ...` with quoted
// values last:
//
//   TASK timestamp=12.000000500 tid=100 pid=100
//   FORK timestamp=13.000000000 pid=101 ppid=100
//   SESS timestamp=12.000000000 pid=100 sid=0123456789abcdef exename="/bin/ls"
//   DLOP timestamp=14.000000000 tid=100 sid=0123456789abcdef base=7f0000001000 libname="/lib/libc.so"

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tracing::{debug, warn};

use super::{
    DlopenMsg, SessionMsg, TaskMsg, Timestamp, TAG_DLOP, TAG_FORK, TAG_SESS, TAG_TASK,
    TASK_TXT_FILE,
};
use crate::error::{DataError, DataResult};
use crate::session::{SessionId, SessionRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskLogEntry {
    Task(TaskMsg),
    /// `tid` is the child, `pid` the parent pid.
    Fork(TaskMsg),
    Session { msg: SessionMsg, exename: String },
    Dlopen { msg: DlopenMsg, libname: String },
}

/// Parses one line. Returns `Ok(None)` for blank lines and unknown tags.
/// A tag counts only when followed by a single space.
pub fn parse_line(line: &str) -> Result<Option<TaskLogEntry>, String> {
    let line = line.trim_end_matches(&['\n', '\r'][..]);
    if line.as_bytes().get(4) != Some(&b' ') {
        return Ok(None);
    }
    let Some(tag) = line.get(..4) else {
        return Ok(None);
    };

    let entry = match tag {
        TAG_TASK => TaskLogEntry::Task(TaskMsg {
            time: timestamp(line)?,
            tid: int_field(line, "tid")?,
            pid: int_field(line, "pid")?,
        }),
        TAG_FORK => TaskLogEntry::Fork(TaskMsg {
            time: timestamp(line)?,
            tid: int_field(line, "pid")?,
            pid: int_field(line, "ppid")?,
        }),
        TAG_SESS => {
            let pid = int_field(line, "pid")?;
            let msg = SessionMsg {
                task: TaskMsg {
                    time: timestamp(line)?,
                    pid,
                    tid: pid,
                },
                sid: SessionId::new(field(line, "sid")?),
            };
            let exename = quoted_field(line, "exename")?.to_string();
            TaskLogEntry::Session { msg, exename }
        }
        TAG_DLOP => {
            let tid = int_field(line, "tid")?;
            let base = field(line, "base")?;
            let msg = DlopenMsg {
                task: TaskMsg {
                    time: timestamp(line)?,
                    pid: tid,
                    tid,
                },
                sid: SessionId::new(field(line, "sid")?),
                base_addr: u64::from_str_radix(base, 16)
                    .map_err(|_| format!("invalid base address: {base}"))?,
            };
            let libname = quoted_field(line, "libname")?.to_string();
            TaskLogEntry::Dlopen { msg, libname }
        }
        _ => return Ok(None),
    };

    Ok(Some(entry))
}

/// Unquoted part of the line, so that keys are never matched inside paths.
fn plain_part(line: &str) -> &str {
    match line.find("=\"") {
        Some(pos) => &line[..pos],
        None => line,
    }
}

fn field<'a>(line: &'a str, key: &str) -> Result<&'a str, String> {
    let plain = plain_part(line);
    let marker = format!(" {key}=");
    let start = plain
        .find(&marker)
        .map(|pos| pos + marker.len())
        .ok_or_else(|| format!("missing field: {key}"))?;
    let rest = &plain[start..];
    let end = rest.find(' ').unwrap_or(rest.len());
    Ok(&rest[..end])
}

fn int_field(line: &str, key: &str) -> Result<i32, String> {
    let value = field(line, key)?;
    value
        .parse()
        .map_err(|_| format!("invalid {key}: {value}"))
}

fn timestamp(line: &str) -> Result<u64, String> {
    let value = field(line, "timestamp")?;
    Timestamp::parse(value)
        .map(|ts| ts.0)
        .ok_or_else(|| format!("invalid timestamp: {value}"))
}

/// Value between `key="` and the last double quote on the line.
fn quoted_field<'a>(line: &'a str, key: &str) -> Result<&'a str, String> {
    let marker = format!("{key}=\"");
    let start = line
        .find(&marker)
        .map(|pos| pos + marker.len())
        .ok_or_else(|| format!("missing quoted field: {key}"))?;
    let rest = &line[start..];
    Ok(match rest.rfind('"') {
        Some(end) => &rest[..end],
        None => rest,
    })
}

/// Reads `task.txt` in `dirname` into `sessions`.
///
/// SESS and DLOP lines are skipped unless `needs_session` is set. A missing
/// file is reported as [`DataError::NotFound`] so the caller can fall back
/// to the legacy `task` file.
///
/// Lines that fail to parse are logged and skipped; the rest of the file is
/// still read and [`DataError::Malformed`] naming the first bad line is
/// returned at the end. A DLOP line for a session not seen yet stops
/// reading with [`DataError::Inconsistent`]. Entities registered before an
/// error stay in the registry.
pub fn read_task_txt_file(
    sessions: &mut SessionRegistry,
    dirname: &Path,
    needs_session: bool,
    sym_rel_addr: bool,
) -> DataResult<()> {
    let path = dirname.join(TASK_TXT_FILE);
    let file = File::open(&path).map_err(|err| DataError::io(&path, err))?;
    let mut reader = BufReader::new(file);

    debug!(path = %path.display(), "reading task log");

    let mut buf = Vec::new();
    let mut lineno = 0usize;
    let mut first_bad: Option<(usize, String)> = None;
    let mut bad_lines = 0usize;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|err| DataError::io(&path, err))?;
        if n == 0 {
            break;
        }
        lineno += 1;

        let line = String::from_utf8_lossy(&buf);
        if !needs_session && (line.starts_with(TAG_SESS) || line.starts_with(TAG_DLOP)) {
            continue;
        }

        let entry = match parse_line(&line) {
            Ok(entry) => entry,
            Err(reason) => {
                warn!(path = %path.display(), lineno, %reason, "skipping invalid task log line");
                bad_lines += 1;
                if first_bad.is_none() {
                    first_bad = Some((lineno, reason));
                }
                continue;
            }
        };

        match entry {
            Some(TaskLogEntry::Task(msg)) => {
                sessions.create_task(&msg, false, needs_session);
            }
            Some(TaskLogEntry::Fork(msg)) => {
                sessions.create_task(&msg, true, needs_session);
            }
            Some(TaskLogEntry::Session { msg, exename }) => {
                sessions.create_session(&msg, dirname, &exename, sym_rel_addr);
            }
            Some(TaskLogEntry::Dlopen { msg, libname }) => {
                if !sessions.add_dlopen(&msg.sid, msg.task.time, msg.base_addr, &libname) {
                    return Err(DataError::inconsistent(
                        &path,
                        format!(
                            "line {lineno}: library {libname} loaded by unknown session {}",
                            msg.sid
                        ),
                    ));
                }
            }
            None => {
                if !line.trim().is_empty() {
                    debug!(path = %path.display(), lineno, "skipping unknown task log line");
                }
            }
        }
    }

    match first_bad {
        Some((lineno, reason)) => Err(DataError::malformed(
            &path,
            format!("line {lineno}: {reason} ({bad_lines} invalid lines skipped)"),
        )),
        None => Ok(()),
    }
}
