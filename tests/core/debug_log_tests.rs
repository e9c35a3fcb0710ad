//! Tests for the size-rotated debug log.

use cfscan::core::debug_log::DebugLog;
use serial_test::serial;

#[test]
#[serial]
fn disabled_logger_writes_nothing() {
    std::env::remove_var("CFSCAN_DEBUG");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debug.log");
    let log = DebugLog::with_path(path.clone());
    log.write("Test", "hello");
    assert!(!path.exists());
}

#[test]
#[serial]
fn enabled_logger_appends_lines() {
    std::env::set_var("CFSCAN_DEBUG", "true");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debug.log");
    let log = DebugLog::with_path(path.clone());
    log.write("Test", "first");
    log.write("Test", "second");
    std::env::remove_var("CFSCAN_DEBUG");

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("[Test] first"));
    assert!(lines[1].contains("[Test] second"));
}

#[test]
#[serial]
fn oversized_log_swaps_to_dot_one() {
    std::env::set_var("CFSCAN_DEBUG", "true");
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("debug.log");
    // Pre-seed a file past the 5 MiB budget.
    std::fs::write(&path, vec![b'x'; 5 * 1024 * 1024 + 1]).unwrap();

    let log = DebugLog::with_path(path.clone());
    log.write("Test", "triggers rotation");
    std::env::remove_var("CFSCAN_DEBUG");

    let swapped = path.with_extension("log.1");
    assert!(swapped.exists(), "no .1 swap file");
    assert!(std::fs::metadata(&swapped).unwrap().len() > 5 * 1024 * 1024);
    let fresh = std::fs::read_to_string(&path).unwrap();
    assert!(fresh.contains("triggers rotation"));
    assert!(fresh.len() < 1024);
}
