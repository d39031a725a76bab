// Sidecar metadata stored after the header in `info`.
//
// One `key:value` pair per line. Which sections must be present is decided
// by the header's info mask.

use std::collections::BTreeMap;
use std::io::BufRead;

use serde::Serialize;

use crate::collab::InfoReader;
use crate::error::{DataError, DataResult};
use crate::header::{self, InfoMask};

/// (info mask bit, key or key prefix that must appear)
const SECTIONS: &[(u64, &str)] = &[
    (header::INFO_EXE_NAME, "exename"),
    (header::INFO_EXE_BUILD_ID, "build_id"),
    (header::INFO_EXIT_STATUS, "exit_status"),
    (header::INFO_CMDLINE, "cmdline"),
    (header::INFO_CPUINFO, "cpuinfo"),
    (header::INFO_MEMINFO, "meminfo"),
    (header::INFO_OSINFO, "osinfo"),
    (header::INFO_TASKINFO, "taskinfo"),
    (header::INFO_USAGEINFO, "usageinfo"),
    (header::INFO_LOADINFO, "loadinfo"),
    (header::INFO_ARG_SPEC, "argspec"),
    (header::INFO_RECORD_DATE, "record_date"),
    (header::INFO_PATTERN_TYPE, "pattern_type"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TraceInfo {
    pub exename: Option<String>,
    pub build_id: Option<String>,
    pub exit_status: Option<i32>,
    pub cmdline: Option<String>,
    pub argspec: Option<String>,
    pub retspec: Option<String>,
    /// Every pair as read, including the ones above.
    pub entries: BTreeMap<String, String>,
}

impl TraceInfo {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Argument and return value specs joined the way the recorder took them.
    pub fn arg_spec(&self) -> String {
        [self.argspec.as_deref(), self.retspec.as_deref()]
            .into_iter()
            .flatten()
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(";")
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TextInfoReader;

impl InfoReader for TextInfoReader {
    fn read_info(&mut self, mask: InfoMask, input: &mut dyn BufRead) -> DataResult<TraceInfo> {
        let mut info = TraceInfo::default();

        for (lineno, line) in input.lines().enumerate() {
            let line = line
                .map_err(|err| DataError::collaborator(format!("cannot read info: {err}")))?;
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                DataError::collaborator(format!("line {}: expected key:value", lineno + 1))
            })?;
            info.entries.insert(key.trim().to_string(), value.trim().to_string());
        }

        for &(bit, key) in SECTIONS {
            if mask.has(bit) && !info.entries.keys().any(|k| k.starts_with(key)) {
                return Err(DataError::collaborator(format!("missing {key} section")));
            }
        }

        info.exename = info.get("exename").map(str::to_string);
        info.build_id = info.get("build_id").map(str::to_string);
        info.cmdline = info.get("cmdline").map(str::to_string);
        info.argspec = info.get("argspec").map(str::to_string);
        info.retspec = info.get("retspec").map(str::to_string);
        info.exit_status = match info.get("exit_status") {
            Some(status) => Some(status.parse().map_err(|_| {
                DataError::collaborator(format!("invalid exit_status: {status}"))
            })?),
            None => None,
        };

        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::header::{INFO_ARG_SPEC, INFO_CPUINFO, INFO_EXE_NAME, INFO_EXIT_STATUS};

    fn read(mask: u64, text: &str) -> DataResult<TraceInfo> {
        TextInfoReader.read_info(InfoMask(mask), &mut text.as_bytes())
    }

    #[test]
    fn read_info__all_known_keys__then_fields_populated() {
        let info = read(
            INFO_EXE_NAME | INFO_EXIT_STATUS | INFO_ARG_SPEC | INFO_CPUINFO,
            "exename:/usr/bin/ls\nexit_status:0\nargspec:main@arg1\nretspec:main@retval\ncpuinfo:lines=2\ncpuinfo:nr_cpus=8\n",
        )
        .unwrap();

        assert_eq!(info.exename.as_deref(), Some("/usr/bin/ls"));
        assert_eq!(info.exit_status, Some(0));
        assert_eq!(info.arg_spec(), "main@arg1;main@retval");
        assert_eq!(info.get("cpuinfo"), Some("nr_cpus=8"));
    }

    #[test]
    fn read_info__masked_section_missing__then_error() {
        let err = read(INFO_EXE_NAME | INFO_ARG_SPEC, "exename:/bin/true\n").unwrap_err();
        assert!(matches!(err, DataError::Collaborator(_)));
        assert!(err.to_string().contains("argspec"));
    }

    #[test]
    fn read_info__line_without_separator__then_error() {
        let err = read(0, "garbage\n").unwrap_err();
        assert!(err.to_string().contains("line 1"));
    }

    #[test]
    fn read_info__empty_mask_and_input__then_default() {
        let info = read(0, "").unwrap();
        assert_eq!(info, TraceInfo::default());
        assert_eq!(info.arg_spec(), "");
    }

    #[test]
    fn trace_info__clear__then_default() {
        let mut info = read(INFO_EXE_NAME, "exename:/bin/a\n").unwrap();
        info.clear();
        assert!(info.exename.is_none());
        assert!(info.entries.is_empty());
    }
}
