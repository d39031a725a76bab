use std::{fmt, io::Write as _, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::{
    collab::Collaborators,
    data_file::{DataFile, OpenOptions, TaskLogSource, UFTRACE_DIR_NAME},
    header::Header,
    order::DataOrder,
    session::{Session, Task},
    task_log::Timestamp,
};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "trace-info",
    author,
    version,
    about = "Summarize a recorded trace data directory",
    long_about = None
)]
pub struct Args {
    /// Trace data directory
    #[arg(value_name = "DIR", default_value = UFTRACE_DIR_NAME)]
    pub data: PathBuf,

    /// Executable name to use instead of the recorded one
    #[arg(long, value_name = "PATH")]
    pub exename: Option<String>,

    /// Skip kernel functions outside of the traced process
    #[arg(long)]
    pub kernel_skip_out: bool,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub open: OpenOptions,
    pub json: bool,
}

impl From<Args> for AppConfig {
    fn from(value: Args) -> Self {
        Self {
            open: OpenOptions {
                dirname: value.data,
                exename: value.exename,
                kernel_skip_out: value.kernel_skip_out,
                ..OpenOptions::default()
            },
            json: value.json,
        }
    }
}

pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

pub fn run(config: AppConfig) -> Result<()> {
    let mut data = DataFile::open(&config.open, Collaborators::default()).with_context(|| {
        format!(
            "failed to open data directory {}",
            config.open.dirname.display()
        )
    })?;

    let output = if config.json {
        render_json(&data)?
    } else {
        render_text(&data)?
    };

    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .context("failed to write summary")?;

    data.close();
    info!("trace info complete");
    Ok(())
}

#[derive(Serialize)]
struct Summary<'a> {
    dirname: String,
    exename: Option<&'a str>,
    header: &'a Header,
    order: &'a DataOrder,
    task_log: TaskLogSource,
    sessions: Vec<&'a Session>,
    tasks: Vec<&'a Task>,
}

pub fn render_json(data: &DataFile) -> Result<String> {
    let summary = Summary {
        dirname: data.dirname().display().to_string(),
        exename: data.exename(),
        header: data.header(),
        order: data.order(),
        task_log: data.task_log(),
        sessions: data.sessions().sessions().collect(),
        tasks: data.sessions().tasks().collect(),
    };
    let mut json = serde_json::to_string_pretty(&summary).context("failed to encode summary")?;
    json.push('\n');
    Ok(json)
}

pub fn render_text(data: &DataFile) -> Result<String> {
    let mut out = String::new();
    write_text(data, &mut out).context("failed to format summary")?;
    Ok(out)
}

fn write_text<W: fmt::Write>(data: &DataFile, out: &mut W) -> fmt::Result {
    let header = data.header();
    let order = data.order();

    writeln!(out, "# data directory: {}", data.dirname().display())?;
    writeln!(out, "# exename: {}", data.exename().unwrap_or("(unknown)"))?;
    writeln!(
        out,
        "# version: {}  endian: {:?}  class: {}-bit",
        header.version,
        header.endian,
        if header.class == 1 { 32 } else { 64 }
    )?;
    writeln!(
        out,
        "# feat_mask: {:#x}  info_mask: {:#x}  max_stack: {}",
        header.feat_mask.0, header.info_mask.0, header.max_stack
    )?;
    writeln!(
        out,
        "# byte swap: {}  bit swap: {}",
        order.needs_byte_swap, order.needs_bit_swap
    )?;
    writeln!(out, "# task log: {:?}", data.task_log())?;

    let registry = data.sessions();
    writeln!(out, "# sessions: {}", registry.session_count())?;
    for session in registry.sessions() {
        writeln!(
            out,
            "  {} pid={} start={} exename={}",
            session.sid,
            session.pid,
            Timestamp(session.start_time),
            session.exename
        )?;
        for lib in session.dlopen_libs() {
            writeln!(
                out,
                "    dlopen {} base={:#x} {}",
                Timestamp(lib.time),
                lib.base_addr,
                lib.libname
            )?;
        }
    }

    writeln!(out, "# tasks: {}", registry.task_count())?;
    for task in registry.tasks() {
        let sid = task.session.as_ref().map_or("-", |sid| sid.as_str());
        writeln!(
            out,
            "  tid={} pid={} ppid={} sid={}{}",
            task.tid,
            task.pid,
            task.ppid,
            sid,
            if task.fork { " (fork)" } else { "" }
        )?;
    }

    Ok(())
}
