//! Reader and writer for recorded trace data directories.
//!
//! A data directory holds an `info` file (fixed header plus metadata), a
//! task log (`task.txt`, or the binary `task` file of older recorders) and
//! the per-task record streams. This crate validates the header, works out
//! the byte and bit order the data was written in and rebuilds the
//! session/task registry that later stages use for symbol resolution.

pub mod app;
pub mod collab;
pub mod data_file;
pub mod error;
pub mod header;
pub mod info;
pub mod order;
pub mod session;
pub mod task_log;

pub use collab::{ArgSpecSetup, Collaborators, InfoReader, KernelData};
pub use data_file::{DataFile, OpenOptions, TaskLogSource};
pub use error::{DataError, DataResult};
pub use header::{FeatureMask, Header, InfoMask};
pub use info::TraceInfo;
pub use order::{DataOrder, Endian, Record};
pub use session::{Session, SessionId, SessionRegistry, Task};
