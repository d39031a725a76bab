// Appenders for `task.txt`.
//
// Every call opens the file in append mode, writes one complete line with a
// single write and closes it again. Forked children and their parents append
// to the same file without sharing a handle or a lock; interleaving stays
// line-granular only while each line fits in MAX_LINE_LEN.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use super::{DlopenMsg, SessionMsg, TaskMsg, Timestamp, MAX_LINE_LEN, TASK_TXT_FILE};
use crate::error::{DataError, DataResult};

pub fn format_task_line(msg: &TaskMsg) -> String {
    format!(
        "TASK timestamp={} tid={} pid={}\n",
        Timestamp(msg.time),
        msg.tid,
        msg.pid
    )
}

/// `msg.tid` is the child and `msg.pid` the parent pid.
pub fn format_fork_line(msg: &TaskMsg) -> String {
    format!(
        "FORK timestamp={} pid={} ppid={}\n",
        Timestamp(msg.time),
        msg.tid,
        msg.pid
    )
}

pub fn format_session_line(msg: &SessionMsg, exename: &str) -> String {
    format!(
        "SESS timestamp={} pid={} sid={} exename=\"{}\"\n",
        Timestamp(msg.task.time),
        msg.task.pid,
        msg.sid,
        exename
    )
}

pub fn format_dlopen_line(msg: &DlopenMsg, libname: &str) -> String {
    format!(
        "DLOP timestamp={} tid={} sid={} base={:x} libname=\"{}\"\n",
        Timestamp(msg.task.time),
        msg.task.tid,
        msg.sid,
        msg.base_addr,
        libname
    )
}

pub fn write_task_info(dirname: &Path, msg: &TaskMsg) -> DataResult<()> {
    append_line(dirname, &format_task_line(msg))
}

pub fn write_fork_info(dirname: &Path, msg: &TaskMsg) -> DataResult<()> {
    append_line(dirname, &format_fork_line(msg))
}

pub fn write_session_info(dirname: &Path, msg: &SessionMsg, exename: &str) -> DataResult<()> {
    append_line(dirname, &format_session_line(msg, exename))
}

pub fn write_dlopen_info(dirname: &Path, msg: &DlopenMsg, libname: &str) -> DataResult<()> {
    append_line(dirname, &format_dlopen_line(msg, libname))
}

fn append_line(dirname: &Path, line: &str) -> DataResult<()> {
    let path = dirname.join(TASK_TXT_FILE);

    if line.len() > MAX_LINE_LEN {
        return Err(DataError::LineTooLong {
            len: line.len(),
            max: MAX_LINE_LEN,
        });
    }
    if line[..line.len() - 1].contains('\n') {
        return Err(DataError::malformed(&path, "value contains a newline"));
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| DataError::io(&path, err))?;
    file.write_all(line.as_bytes())
        .map_err(|err| DataError::io(&path, err))
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::session::SessionId;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn format_task_line__then_matches_grammar() {
        let line = format_task_line(&TaskMsg {
            time: 12_000_000_500,
            pid: 100,
            tid: 100,
        });
        assert_eq!(line, "TASK timestamp=12.000000500 tid=100 pid=100\n");
    }

    #[test]
    fn format_fork_line__then_child_tid_written_as_pid() {
        let line = format_fork_line(&TaskMsg {
            time: 13_000_000_000,
            pid: 200,
            tid: 100,
        });
        assert_eq!(line, "FORK timestamp=13.000000000 pid=100 ppid=200\n");
    }

    #[test]
    fn format_dlopen_line__then_base_in_hex() {
        let msg = DlopenMsg {
            task: TaskMsg {
                time: 1,
                pid: 5,
                tid: 5,
            },
            sid: SessionId::from("0123456789abcdef"),
            base_addr: 0x7fff_0000,
        };
        assert_eq!(
            format_dlopen_line(&msg, "/lib/a b.so"),
            "DLOP timestamp=0.000000001 tid=5 sid=0123456789abcdef base=7fff0000 libname=\"/lib/a b.so\"\n"
        );
    }

    #[test]
    fn write_task_info__repeated__then_lines_appended() {
        let dir = TempDir::new().unwrap();
        for tid in 1..=3 {
            write_task_info(
                dir.path(),
                &TaskMsg {
                    time: tid as u64,
                    pid: 1,
                    tid,
                },
            )
            .unwrap();
        }

        let contents = fs::read_to_string(dir.path().join(TASK_TXT_FILE)).unwrap();
        assert_eq!(contents.lines().count(), 3);
        assert!(contents.ends_with("tid=3 pid=1\n"));
    }

    #[test]
    fn write_session_info__oversized_name__then_rejected_without_writing() {
        let dir = TempDir::new().unwrap();
        let msg = SessionMsg {
            task: TaskMsg {
                time: 0,
                pid: 1,
                tid: 1,
            },
            sid: SessionId::from("0123456789abcdef"),
        };
        let name = "x".repeat(MAX_LINE_LEN);

        let err = write_session_info(dir.path(), &msg, &name).unwrap_err();
        assert!(matches!(err, DataError::LineTooLong { max: MAX_LINE_LEN, .. }));
        assert!(!dir.path().join(TASK_TXT_FILE).exists());
    }

    #[test]
    fn write_session_info__newline_in_name__then_rejected() {
        let dir = TempDir::new().unwrap();
        let msg = SessionMsg {
            task: TaskMsg {
                time: 0,
                pid: 1,
                tid: 1,
            },
            sid: SessionId::from("0123456789abcdef"),
        };
        let err = write_session_info(dir.path(), &msg, "/bin/a\nTASK").unwrap_err();
        assert!(err.to_string().contains("newline"));
    }

    #[test]
    fn write_task_info__missing_directory__then_io_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope");
        let err = write_task_info(
            &missing,
            &TaskMsg {
                time: 0,
                pid: 1,
                tid: 1,
            },
        )
        .unwrap_err();
        assert!(err.is_not_found());
    }
}
