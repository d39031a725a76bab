// Reader for the legacy binary `task` file.
//
// The file is a plain sequence of frames with no count or terminator:
//
//   envelope  { magic: u16 = 0xface, type: u16, len: u32 }          8 bytes
//   SESSION   { time: u64, pid: i32, tid: i32, sid: [u8; 16],
//               unused: i32, namelen: i32 } + name + pad to 8       40+ bytes
//   TID/FORK  { time: u64, pid: i32, tid: i32 }                     16 bytes
//
// Integers are in the byte order of the recording machine.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian, ReadBytesExt};
use tracing::{debug, warn};

use super::{SessionMsg, TaskMsg, TASK_FILE};
use crate::error::{DataError, DataResult};
use crate::order::Endian;
use crate::session::{SessionId, SessionRegistry, SESSION_ID_LEN};

pub const MSG_MAGIC: u16 = 0xface;

pub const MSG_REC_START: u16 = 1;
pub const MSG_REC_END: u16 = 2;
pub const MSG_TID: u16 = 3;
pub const MSG_FORK_START: u16 = 4;
pub const MSG_FORK_END: u16 = 5;
pub const MSG_SESSION: u16 = 6;

pub const MSG_ENVELOPE_SIZE: usize = 8;
pub const MSG_TASK_SIZE: usize = 16;
pub const MSG_SESSION_SIZE: usize = 40;

/// Reads the legacy `task` file in `dirname` into `sessions`.
///
/// Reading stops at end of file, which includes a file ending inside a
/// frame envelope. A bad envelope magic, unknown frame type or truncated
/// frame body stops reading with [`DataError::Malformed`]. Nothing is
/// registered from a frame that was not read completely; entities from
/// earlier frames stay in the registry.
pub fn read_task_file(
    sessions: &mut SessionRegistry,
    dirname: &Path,
    needs_session: bool,
    sym_rel_addr: bool,
    endian: Endian,
) -> DataResult<()> {
    let path = dirname.join(TASK_FILE);
    let file = File::open(&path).map_err(|err| DataError::io(&path, err))?;
    let mut reader = BufReader::new(file);

    debug!(path = %path.display(), ?endian, "reading legacy task file");

    let mut frames = FrameReader {
        sessions,
        dirname,
        path: &path,
        needs_session,
        sym_rel_addr,
    };
    match endian {
        Endian::Little => frames.read_all::<LittleEndian, _>(&mut reader),
        Endian::Big => frames.read_all::<BigEndian, _>(&mut reader),
    }
}

struct FrameReader<'a> {
    sessions: &'a mut SessionRegistry,
    dirname: &'a Path,
    path: &'a Path,
    needs_session: bool,
    sym_rel_addr: bool,
}

impl FrameReader<'_> {
    fn read_all<B: ByteOrder, R: Read>(&mut self, reader: &mut R) -> DataResult<()> {
        let mut envelope = [0u8; MSG_ENVELOPE_SIZE];
        let mut count = 0usize;

        while read_envelope(reader, &mut envelope).map_err(|err| DataError::io(self.path, err))? {
            let magic = B::read_u16(&envelope[0..2]);
            let kind = B::read_u16(&envelope[2..4]);

            if magic != MSG_MAGIC {
                return Err(DataError::malformed(
                    self.path,
                    format!("bad frame magic {magic:#06x} after {count} frames"),
                ));
            }

            match kind {
                MSG_SESSION => {
                    let (msg, exename) = self.read_session::<B, R>(reader)?;
                    if self.needs_session {
                        self.sessions
                            .create_session(&msg, self.dirname, &exename, self.sym_rel_addr);
                    }
                }
                MSG_TID => {
                    let msg = self.read_task::<B, R>(reader)?;
                    self.sessions.create_task(&msg, false, self.needs_session);
                }
                MSG_FORK_END => {
                    let msg = self.read_task::<B, R>(reader)?;
                    self.sessions.create_task(&msg, true, self.needs_session);
                }
                other => {
                    warn!(path = %self.path.display(), kind = other, "invalid contents in task file");
                    return Err(DataError::malformed(
                        self.path,
                        format!("unexpected frame type {other}"),
                    ));
                }
            }
            count += 1;
        }

        debug!(frames = count, "legacy task file done");
        Ok(())
    }

    fn truncated(&self, err: io::Error) -> DataError {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            DataError::malformed(self.path, "truncated frame")
        } else {
            DataError::io(self.path, err)
        }
    }

    fn read_task<B: ByteOrder, R: Read>(&self, reader: &mut R) -> DataResult<TaskMsg> {
        let mut read = || -> io::Result<TaskMsg> {
            Ok(TaskMsg {
                time: reader.read_u64::<B>()?,
                pid: reader.read_i32::<B>()?,
                tid: reader.read_i32::<B>()?,
            })
        };
        read().map_err(|err| self.truncated(err))
    }

    fn read_session<B: ByteOrder, R: Read>(
        &self,
        reader: &mut R,
    ) -> DataResult<(SessionMsg, String)> {
        let mut read = || -> io::Result<(SessionMsg, i32)> {
            let time = reader.read_u64::<B>()?;
            let pid = reader.read_i32::<B>()?;
            let tid = reader.read_i32::<B>()?;
            let mut sid = [0u8; SESSION_ID_LEN];
            reader.read_exact(&mut sid)?;
            let _unused = reader.read_i32::<B>()?;
            let namelen = reader.read_i32::<B>()?;

            let msg = SessionMsg {
                task: TaskMsg { time, pid, tid },
                sid: SessionId::from_raw(&sid),
            };
            Ok((msg, namelen))
        };
        let (msg, namelen) = read().map_err(|err| self.truncated(err))?;

        let namelen = usize::try_from(namelen)
            .map_err(|_| DataError::malformed(self.path, format!("invalid name length {namelen}")))?;
        let padded = namelen + padding(namelen);
        let mut name = Vec::new();
        reader
            .by_ref()
            .take(padded as u64)
            .read_to_end(&mut name)
            .map_err(|err| self.truncated(err))?;
        if name.len() < padded {
            return Err(DataError::malformed(
                self.path,
                format!("truncated session name: {} of {padded} bytes", name.len()),
            ));
        }
        name.truncate(namelen);

        let exename = String::from_utf8_lossy(&name)
            .trim_end_matches('\0')
            .to_string();
        Ok((msg, exename))
    }
}

/// Bytes needed after `len` to reach the next 8-byte boundary.
pub fn padding(len: usize) -> usize {
    (8 - len % 8) % 8
}

/// Fills `buf` and returns `true`, or returns `false` at end of file even
/// when part of `buf` was read.
fn read_envelope<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}
