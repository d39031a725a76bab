#![allow(non_snake_case)]

use std::fs;

use proptest::prelude::*;
use tempfile::TempDir;
use trace_data::error::DataError;
use trace_data::session::{SessionId, SessionRegistry};
use trace_data::task_log::writer::{
    format_dlopen_line, format_fork_line, format_session_line, format_task_line,
};
use trace_data::task_log::{
    read_task_txt_file, write_dlopen_info, write_fork_info, write_session_info, write_task_info,
    DlopenMsg, SessionMsg, TaskMsg, MAX_LINE_LEN, TASK_TXT_FILE,
};

fn task(time: u64, pid: i32, tid: i32) -> TaskMsg {
    TaskMsg { time, pid, tid }
}

#[test]
fn write_then_read__full_log__then_registry_matches_to_the_nanosecond() {
    let dir = TempDir::new().expect("temp dir");
    let sid = SessionId::from("fedcba9876543210");

    let sess = SessionMsg {
        task: task(1_700_000_000_123_456_789, 4242, 4242),
        sid: sid.clone(),
    };
    write_session_info(dir.path(), &sess, "/usr/local/bin/my \"tool\"").expect("sess");
    write_task_info(dir.path(), &task(1_700_000_000_123_456_790, 4242, 4242)).expect("task");
    write_fork_info(dir.path(), &task(1_700_000_001_000_000_001, 4242, 4243)).expect("fork");
    write_dlopen_info(
        dir.path(),
        &DlopenMsg {
            task: task(1_700_000_002_000_000_000, 4242, 4242),
            sid: sid.clone(),
            base_addr: 0xdead_b000,
        },
        "/usr/lib/libplugin.so",
    )
    .expect("dlop");

    let mut registry = SessionRegistry::new();
    read_task_txt_file(&mut registry, dir.path(), true, false).expect("read back");

    let session = registry.session(&sid).expect("session");
    assert_eq!(session.start_time, 1_700_000_000_123_456_789);
    assert_eq!(session.pid, 4242);
    assert_eq!(session.exename, "/usr/local/bin/my \"tool\"");

    let lib = &session.dlopen_libs()[0];
    assert_eq!(lib.time, 1_700_000_002_000_000_000);
    assert_eq!(lib.base_addr, 0xdead_b000);
    assert_eq!(lib.libname, "/usr/lib/libplugin.so");

    let parent = registry.task(4242).expect("parent");
    assert_eq!(parent.time, 1_700_000_000_123_456_790);
    let child = registry.task(4243).expect("child");
    assert_eq!((child.pid, child.ppid), (4243, 4242));
    assert_eq!(child.time, 1_700_000_001_000_000_001);
    assert_eq!(child.session.as_ref(), Some(&sid));
}

#[test]
fn read_task_txt_file__sessions_not_needed__then_only_tasks_registered() {
    let dir = TempDir::new().expect("temp dir");
    let sid = SessionId::from("0000000000000001");
    write_session_info(dir.path(), &SessionMsg { task: task(1, 9, 9), sid: sid.clone() }, "/bin/a")
        .expect("sess");
    write_task_info(dir.path(), &task(2, 9, 9)).expect("task");

    let mut registry = SessionRegistry::new();
    read_task_txt_file(&mut registry, dir.path(), false, false).expect("read");
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.task_count(), 1);
    assert!(registry.task(9).and_then(|t| t.session.as_ref()).is_none());
}

#[test]
fn read_task_txt_file__missing__then_not_found() {
    let dir = TempDir::new().expect("temp dir");
    let mut registry = SessionRegistry::new();
    let err = read_task_txt_file(&mut registry, dir.path(), true, false).expect_err("missing");
    assert!(err.is_not_found());
}

#[test]
fn writer__concurrent_appenders__then_every_line_intact() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().to_path_buf();

    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let path = path.clone();
            std::thread::spawn(move || {
                for n in 0..50 {
                    let tid = worker * 1000 + n;
                    write_task_info(&path, &task(tid as u64, 1, tid)).expect("append");
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    let contents = fs::read_to_string(path.join(TASK_TXT_FILE)).expect("task.txt");
    assert_eq!(contents.lines().count(), 200);
    assert!(contents.lines().all(|line| line.starts_with("TASK timestamp=")));

    let mut registry = SessionRegistry::new();
    read_task_txt_file(&mut registry, &path, false, false).expect("read");
    assert_eq!(registry.task_count(), 200);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_task_and_fork_lines_fit_line_budget(time in any::<u64>(), pid in any::<i32>(), tid in any::<i32>()) {
        let msg = task(time, pid, tid);
        prop_assert!(format_task_line(&msg).len() <= MAX_LINE_LEN);
        prop_assert!(format_fork_line(&msg).len() <= MAX_LINE_LEN);
    }

    #[test]
    fn prop_session_and_dlopen_lines_fit_line_budget(
        time in any::<u64>(),
        pid in any::<i32>(),
        base in any::<u64>(),
        name in "[a-zA-Z0-9/._ -]{0,3900}",
    ) {
        let sid = SessionId::from("0123456789abcdef");
        let sess = SessionMsg { task: task(time, pid, pid), sid: sid.clone() };
        let dlop = DlopenMsg { task: task(time, pid, pid), sid, base_addr: base };
        prop_assert!(format_session_line(&sess, &name).len() <= MAX_LINE_LEN);
        prop_assert!(format_dlopen_line(&dlop, &name).len() <= MAX_LINE_LEN);
    }

    #[test]
    fn prop_oversized_names_rejected_before_writing(extra in 0usize..64) {
        let dir = TempDir::new().expect("temp dir");
        let name = "n".repeat(MAX_LINE_LEN + extra);
        let msg = SessionMsg { task: task(0, 1, 1), sid: SessionId::from("0123456789abcdef") };

        let err = write_session_info(dir.path(), &msg, &name).expect_err("too long");
        prop_assert!(
            matches!(err, DataError::LineTooLong { max: MAX_LINE_LEN, .. }),
            "unexpected error: {}", err
        );
        prop_assert!(!dir.path().join(TASK_TXT_FILE).exists());
    }
}
