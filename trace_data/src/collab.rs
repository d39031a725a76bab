//! Seams to the parts of the tool that live outside this crate.
//!
//! Opening a data directory hands off to these collaborators depending on
//! the header's feature and info masks. Defaults are provided so a data
//! directory can be opened with no kernel or argument support at all.

use std::io::BufRead;
use std::path::Path;

use crate::error::{DataError, DataResult};
use crate::header::{Header, InfoMask};
use crate::info::{TextInfoReader, TraceInfo};

/// Reads the metadata sections that follow the header in `info`.
pub trait InfoReader: Send + Sync {
    fn read_info(&mut self, mask: InfoMask, input: &mut dyn BufRead) -> DataResult<TraceInfo>;
}

/// Prepares argument and return value decoding from the recorded argument spec.
pub trait ArgSpecSetup: Send + Sync {
    fn setup(&mut self, argspec: &str, header: &Header) -> DataResult<()>;
}

/// Kernel trace data of a data directory.
pub trait KernelData: Send + Sync {
    fn setup(&mut self, dirname: &Path, skip_out: bool) -> DataResult<()>;
    fn load_symbols(&mut self, dirname: &Path) -> DataResult<()>;
    fn is_active(&self) -> bool;
    fn finish(&mut self);
}

#[derive(Debug, Default)]
pub struct NoArgSpec;

impl ArgSpecSetup for NoArgSpec {
    fn setup(&mut self, argspec: &str, _header: &Header) -> DataResult<()> {
        tracing::debug!(argspec, "argument decoding not configured");
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoKernel;

impl KernelData for NoKernel {
    fn setup(&mut self, dirname: &Path, _skip_out: bool) -> DataResult<()> {
        Err(DataError::collaborator(format!(
            "no kernel support for {}",
            dirname.display()
        )))
    }

    fn load_symbols(&mut self, _dirname: &Path) -> DataResult<()> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        false
    }

    fn finish(&mut self) {}
}

pub struct Collaborators {
    pub info: Box<dyn InfoReader>,
    pub arg_spec: Box<dyn ArgSpecSetup>,
    pub kernel: Box<dyn KernelData>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            info: Box::new(TextInfoReader),
            arg_spec: Box::new(NoArgSpec),
            kernel: Box::new(NoKernel),
        }
    }
}

impl Collaborators {
    pub fn with_info(mut self, info: impl InfoReader + 'static) -> Self {
        self.info = Box::new(info);
        self
    }

    pub fn with_arg_spec(mut self, arg_spec: impl ArgSpecSetup + 'static) -> Self {
        self.arg_spec = Box::new(arg_spec);
        self
    }

    pub fn with_kernel(mut self, kernel: impl KernelData + 'static) -> Self {
        self.kernel = Box::new(kernel);
        self
    }
}
