//! Opening and closing a trace data directory.
//!
//! [`DataFile::open`] resolves the directory, validates the `info` header,
//! reads the sidecar metadata, rebuilds the session/task registry from the
//! task log and activates optional collaborators based on the feature mask.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::collab::{ArgSpecSetup, Collaborators, KernelData};
use crate::error::{DataError, DataResult};
use crate::header::{
    Header, DEFAULT_MAX_STACK, FEAT_ARGUMENT, FEAT_KERNEL, FEAT_MAX_STACK, FEAT_RETVAL,
    FEAT_SYM_REL_ADDR, FEAT_TASK_SESSION, HEADER_SIZE,
};
use crate::info::TraceInfo;
use crate::order::{BitOrder, DataOrder, Endian};
use crate::session::SessionRegistry;
use crate::task_log::{read_task_file, read_task_txt_file};

/// Default data directory name.
pub const UFTRACE_DIR_NAME: &str = "uftrace.data";
/// Default data directory name of older recorders.
pub const UFTRACE_DIR_OLD_NAME: &str = "ftrace.dir";

pub const INFO_FILE: &str = "info";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenOptions {
    pub dirname: PathBuf,
    /// Overrides the executable name recorded in the sidecar metadata.
    pub exename: Option<String>,
    pub kernel_skip_out: bool,
    /// Bit-field layout the recorder used for record words.
    pub record_packing: BitOrder,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            dirname: PathBuf::from(UFTRACE_DIR_NAME),
            exename: None,
            kernel_skip_out: false,
            record_packing: BitOrder::default(),
        }
    }
}

impl OpenOptions {
    pub fn new(dirname: impl Into<PathBuf>) -> Self {
        Self {
            dirname: dirname.into(),
            ..Self::default()
        }
    }

    pub fn exename(mut self, exename: impl Into<String>) -> Self {
        self.exename = Some(exename.into());
        self
    }

    pub fn kernel_skip_out(mut self, skip: bool) -> Self {
        self.kernel_skip_out = skip;
        self
    }

    pub fn record_packing(mut self, packing: BitOrder) -> Self {
        self.record_packing = packing;
        self
    }
}

/// Where the session/task registry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TaskLogSource {
    /// The data directory was recorded without task tracking.
    NotRecorded,
    TaskTxt,
    LegacyTask,
    /// Task tracking was recorded but neither log could be read.
    Unavailable,
}

/// An open data directory.
pub struct DataFile {
    dirname: PathBuf,
    header: Header,
    order: DataOrder,
    info: TraceInfo,
    sessions: SessionRegistry,
    task_log: TaskLogSource,
    exename: Option<String>,
    exename_from_info: bool,
    arg_spec: Option<Box<dyn ArgSpecSetup>>,
    kernel: Option<Box<dyn KernelData>>,
}

impl DataFile {
    pub fn open(opts: &OpenOptions, collab: Collaborators) -> DataResult<Self> {
        let Collaborators {
            info: mut info_reader,
            arg_spec: mut arg_spec_setup,
            kernel: mut kernel_data,
        } = collab;

        let (dirname, file) = resolve_dir(&opts.dirname)?;
        let info_path = dirname.join(INFO_FILE);
        let mut reader = BufReader::new(file);

        let mut buf = [0u8; HEADER_SIZE];
        read_header(&mut reader, &mut buf).map_err(|err| match err.kind() {
            io::ErrorKind::UnexpectedEof => DataError::malformed(&info_path, "cannot read header data"),
            _ => DataError::io(&info_path, err),
        })?;

        let (mut header, order) = Header::parse_with_packing(&buf, &info_path, opts.record_packing)?;
        debug!(
            version = header.version,
            feat_mask = header.feat_mask.0,
            info_mask = header.info_mask.0,
            byte_swap = order.needs_byte_swap,
            bit_swap = order.needs_bit_swap,
            "header loaded"
        );

        let info = info_reader
            .read_info(header.info_mask, &mut reader)
            .map_err(|err| match err {
                DataError::Collaborator(reason) | DataError::Malformed { reason, .. } => {
                    DataError::malformed(&info_path, reason)
                }
                DataError::Io { source, .. } => DataError::io(&info_path, source),
                other => other,
            })?;
        drop(reader);

        let (exename, exename_from_info) = match (&opts.exename, &info.exename) {
            (Some(name), _) => (Some(name.clone()), false),
            (None, Some(name)) => (Some(name.clone()), true),
            (None, None) => (None, false),
        };

        let mut sessions = SessionRegistry::new();
        let task_log = if header.has_feature(FEAT_TASK_SESSION) {
            let sym_rel_addr = header.has_feature(FEAT_SYM_REL_ADDR);
            load_task_log(&mut sessions, &dirname, sym_rel_addr, header.endian)?
        } else {
            TaskLogSource::NotRecorded
        };

        let arg_spec = if header.has_feature(FEAT_ARGUMENT | FEAT_RETVAL) {
            match arg_spec_setup.setup(&info.arg_spec(), &header) {
                Ok(()) => Some(arg_spec_setup),
                Err(err) => {
                    warn!(error = %err, "cannot set up argument decoding");
                    None
                }
            }
        } else {
            None
        };

        if !header.has_feature(FEAT_MAX_STACK) {
            header.max_stack = DEFAULT_MAX_STACK;
        }

        let kernel = if header.has_feature(FEAT_KERNEL) {
            match kernel_data.setup(&dirname, opts.kernel_skip_out) {
                Ok(()) => {
                    if let Err(err) = kernel_data.load_symbols(&dirname) {
                        warn!(error = %err, "cannot load kernel symbols");
                    }
                    Some(kernel_data)
                }
                Err(err) => {
                    warn!(error = %err, "kernel data unavailable");
                    None
                }
            }
        } else {
            None
        };

        info!(
            dirname = %dirname.display(),
            sessions = sessions.session_count(),
            tasks = sessions.task_count(),
            ?task_log,
            "data directory opened"
        );

        Ok(Self {
            dirname,
            header,
            order,
            info,
            sessions,
            task_log,
            exename,
            exename_from_info,
            arg_spec,
            kernel,
        })
    }

    /// Releases everything the open handle owns. Safe to call repeatedly.
    pub fn close(&mut self) {
        if self.exename_from_info {
            self.exename = None;
            self.exename_from_info = false;
        }

        if let Some(mut kernel) = self.kernel.take() {
            if kernel.is_active() {
                kernel.finish();
            }
        }

        self.arg_spec = None;
        self.info.clear();
        self.sessions.reset();
    }

    /// Directory the data was actually read from.
    pub fn dirname(&self) -> &Path {
        &self.dirname
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn order(&self) -> &DataOrder {
        &self.order
    }

    pub fn info(&self) -> &TraceInfo {
        &self.info
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn task_log(&self) -> TaskLogSource {
        self.task_log
    }

    /// Executable name from the open options, else from the sidecar.
    pub fn exename(&self) -> Option<&str> {
        self.exename.as_deref()
    }

    pub fn max_stack(&self) -> u16 {
        self.header.max_stack
    }

    pub fn has_arg_spec(&self) -> bool {
        self.arg_spec.is_some()
    }

    pub fn has_kernel_data(&self) -> bool {
        self.kernel.as_ref().is_some_and(|k| k.is_active())
    }
}

impl Drop for DataFile {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens `<dirname>/info`. A missing default directory is retried once as
/// its legacy sibling; the returned path is the directory actually used.
fn resolve_dir(dirname: &Path) -> DataResult<(PathBuf, File)> {
    let path = dirname.join(INFO_FILE);
    let err = match File::open(&path) {
        Ok(file) => return Ok((dirname.to_path_buf(), file)),
        Err(err) => err,
    };

    let is_default = dirname.file_name().is_some_and(|name| name == UFTRACE_DIR_NAME);
    if err.kind() != io::ErrorKind::NotFound || !is_default {
        return Err(DataError::io(&path, err));
    }

    let legacy = dirname.with_file_name(UFTRACE_DIR_OLD_NAME);
    let legacy_path = legacy.join(INFO_FILE);
    match File::open(&legacy_path) {
        Ok(file) => {
            info!(dirname = %legacy.display(), "using legacy data directory");
            Ok((legacy, file))
        }
        // report the name that was asked for
        Err(retry) if retry.kind() == io::ErrorKind::NotFound => Err(DataError::NotFound { path }),
        Err(retry) => Err(DataError::io(&legacy_path, retry)),
    }
}

fn read_header<R: Read>(reader: &mut R, buf: &mut [u8; HEADER_SIZE]) -> io::Result<()> {
    reader.read_exact(buf)
}

/// Text log first, legacy binary log only when the text log cannot be read.
fn load_task_log(
    sessions: &mut SessionRegistry,
    dirname: &Path,
    sym_rel_addr: bool,
    endian: Endian,
) -> DataResult<TaskLogSource> {
    match read_task_txt_file(sessions, dirname, true, sym_rel_addr) {
        Ok(()) => return Ok(TaskLogSource::TaskTxt),
        Err(err @ DataError::Inconsistent { .. }) => return Err(err),
        Err(err) if err.is_recoverable() => {
            debug!(error = %err, "falling back to legacy task file");
            sessions.reset();
        }
        Err(err) => {
            warn!(error = %err, "invalid task file, sessions may be incomplete");
            return Ok(TaskLogSource::TaskTxt);
        }
    }

    match read_task_file(sessions, dirname, true, sym_rel_addr, endian) {
        Ok(()) => Ok(TaskLogSource::LegacyTask),
        Err(err) if err.is_recoverable() => {
            warn!(error = %err, "invalid task file");
            sessions.reset();
            Ok(TaskLogSource::Unavailable)
        }
        Err(err) => {
            warn!(error = %err, "invalid task file, sessions may be incomplete");
            Ok(TaskLogSource::LegacyTask)
        }
    }
}
