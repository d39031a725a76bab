//! Session and task registry rebuilt from the task log.
//!
//! Sessions are keyed by session id and tasks by tid, both in ordered maps.
//! The registry is filled once while the data directory is opened and is
//! read-only afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::debug;

use crate::task_log::{SessionMsg, TaskMsg};

/// Length of a session id on the wire.
pub const SESSION_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Builds an id from the fixed-size field of a binary frame, stopping at
    /// the first NUL.
    pub fn from_raw(raw: &[u8; SESSION_ID_LEN]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(SESSION_ID_LEN);
        Self(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DlopenEvent {
    pub time: u64,
    pub base_addr: u64,
    pub libname: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub sid: SessionId,
    pub pid: i32,
    pub tid: i32,
    pub start_time: u64,
    pub dirname: PathBuf,
    pub exename: String,
    pub sym_rel_addr: bool,
    dlopen_libs: Vec<DlopenEvent>,
}

impl Session {
    /// Dynamic-load events in timestamp order.
    pub fn dlopen_libs(&self) -> &[DlopenEvent] {
        &self.dlopen_libs
    }

    /// Library loaded at the highest base address not above `addr` at
    /// `time`, if any.
    pub fn find_dlopen(&self, time: u64, addr: u64) -> Option<&DlopenEvent> {
        self.dlopen_libs
            .iter()
            .filter(|lib| lib.time <= time && lib.base_addr <= addr)
            .max_by_key(|lib| lib.base_addr)
    }

    fn add_dlopen(&mut self, time: u64, base_addr: u64, libname: &str) {
        let pos = self.dlopen_libs.partition_point(|lib| lib.time <= time);
        self.dlopen_libs.insert(
            pos,
            DlopenEvent {
                time,
                base_addr,
                libname: libname.to_string(),
            },
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Task {
    pub tid: i32,
    pub pid: i32,
    /// Parent process id, only set for forked tasks.
    pub ppid: i32,
    pub time: u64,
    pub fork: bool,
    pub session: Option<SessionId>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionRegistry {
    sessions: BTreeMap<SessionId, Session>,
    tasks: BTreeMap<i32, Task>,
    first: Option<SessionId>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a session. A session id seen before is ignored and `false`
    /// is returned.
    pub fn create_session(
        &mut self,
        msg: &SessionMsg,
        dirname: &Path,
        exename: &str,
        sym_rel_addr: bool,
    ) -> bool {
        if self.sessions.contains_key(&msg.sid) {
            debug!(sid = %msg.sid, "ignoring duplicate session");
            return false;
        }

        let session = Session {
            sid: msg.sid.clone(),
            pid: msg.task.pid,
            tid: msg.task.tid,
            start_time: msg.task.time,
            dirname: dirname.to_path_buf(),
            exename: exename.to_string(),
            sym_rel_addr,
            dlopen_libs: Vec::new(),
        };

        debug!(sid = %session.sid, pid = session.pid, exename, "new session");
        if self.first.is_none() {
            self.first = Some(session.sid.clone());
        }
        self.sessions.insert(session.sid.clone(), session);
        true
    }

    /// Registers a task. For forked tasks `msg.pid` carries the parent pid.
    /// The first task registered for a tid wins; later ones return `false`.
    pub fn create_task(&mut self, msg: &TaskMsg, fork: bool, needs_session: bool) -> bool {
        if self.tasks.contains_key(&msg.tid) {
            debug!(tid = msg.tid, fork, "ignoring duplicate task");
            return false;
        }

        let (pid, ppid) = if fork {
            (msg.tid, msg.pid)
        } else {
            (msg.pid, 0)
        };

        let session = if needs_session {
            self.find_task_session(pid, msg.time)
                .or_else(|| self.inherited_session(ppid))
                .or_else(|| self.first.clone())
        } else {
            None
        };

        debug!(tid = msg.tid, pid, ppid, fork, "new task");
        self.tasks.insert(
            msg.tid,
            Task {
                tid: msg.tid,
                pid,
                ppid,
                time: msg.time,
                fork,
                session,
            },
        );
        true
    }

    /// Appends a dynamic-load event; `false` when the session is unknown.
    pub fn add_dlopen(&mut self, sid: &SessionId, time: u64, base_addr: u64, libname: &str) -> bool {
        match self.sessions.get_mut(sid) {
            Some(session) => {
                session.add_dlopen(time, base_addr, libname);
                true
            }
            None => false,
        }
    }

    /// Latest session of `pid` started at or before `time`.
    pub fn find_task_session(&self, pid: i32, time: u64) -> Option<SessionId> {
        self.sessions
            .values()
            .filter(|s| s.pid == pid && s.start_time <= time)
            .max_by_key(|s| s.start_time)
            .map(|s| s.sid.clone())
    }

    fn inherited_session(&self, ppid: i32) -> Option<SessionId> {
        if ppid == 0 {
            return None;
        }
        self.tasks.get(&ppid).and_then(|parent| parent.session.clone())
    }

    pub fn session(&self, sid: &SessionId) -> Option<&Session> {
        self.sessions.get(sid)
    }

    pub fn first_session(&self) -> Option<&Session> {
        self.first.as_ref().and_then(|sid| self.sessions.get(sid))
    }

    pub fn task(&self, tid: i32) -> Option<&Task> {
        self.tasks.get(&tid)
    }

    /// Session a task is attributed to.
    pub fn task_session(&self, tid: i32) -> Option<&Session> {
        self.task(tid)
            .and_then(|t| t.session.as_ref())
            .and_then(|sid| self.sessions.get(sid))
    }

    /// Task that forked `tid`, looked up through its parent pid.
    pub fn parent(&self, tid: i32) -> Option<&Task> {
        let task = self.task(tid)?;
        if !task.fork {
            return None;
        }
        self.tasks.get(&task.ppid)
    }

    pub fn children(&self, tid: i32) -> impl Iterator<Item = &Task> + '_ {
        self.tasks
            .values()
            .filter(move |t| t.fork && t.ppid == tid)
    }

    /// Sessions in session id order.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> + '_ {
        self.sessions.values()
    }

    /// Tasks in tid order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> + '_ {
        self.tasks.values()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty() && self.tasks.is_empty()
    }

    pub fn reset(&mut self) {
        self.sessions.clear();
        self.tasks.clear();
        self.first = None;
    }
}
