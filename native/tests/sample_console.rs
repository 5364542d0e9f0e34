#![cfg(unix)]

use console_bridge::{ConsoleSession, SessionConfig, ShutdownOutcome, TransferProgress};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

const SAMPLE: &str = env!("CARGO_BIN_EXE_sample-console");

fn wait_until(deadline: Duration, condition: impl Fn() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}

fn collecting_session(config: SessionConfig) -> (ConsoleSession, Arc<Mutex<Vec<String>>>) {
    let session = ConsoleSession::new(config);
    let lines = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&lines);
    session.set_output_sink(move |line| sink.lock().unwrap().push(line.to_string()));
    (session, lines)
}

#[test]
fn test_sample_console_round_trip() {
    let config = SessionConfig {
        wants_progress: true,
        ..SessionConfig::default()
    };
    let (session, lines) = collecting_session(config);
    let progress: Arc<Mutex<Vec<TransferProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&progress);
    session.set_progress_sink(move |p| sink.lock().unwrap().push(p.clone()));

    session.start(Path::new(SAMPLE), &[]).expect("start");
    session.execute_command("echo hello bridge").unwrap();
    session.execute_command("progress 2").unwrap();
    session.execute_command("exit").unwrap();

    assert!(wait_until(Duration::from_secs(10), || session.has_exited()));
    assert_eq!(session.close(), Some(ShutdownOutcome::Exited));
    assert_eq!(session.exit_code(), Some(0));
    session.dispose();
    assert!(session.take_dispatch_error().is_none());

    let lines = lines.lock().unwrap().clone();
    assert_eq!(lines.first().map(String::as_str), Some("Sample console ready"));
    assert!(lines.contains(&"sample> echo hello bridge".to_string()));
    assert!(lines.contains(&"hello bridge".to_string()));
    assert!(lines.contains(&"sample.bin 100%".to_string()));
    assert!(!lines.iter().any(|line| line.contains(" 50%")));
    assert!(lines.contains(&"Bye".to_string()));

    let progress = progress.lock().unwrap();
    assert_eq!(progress.len(), 3);
    assert!((progress[2].overall_progress - 1.0).abs() < f64::EPSILON);
}

#[test]
fn test_sample_console_without_progress_sink() {
    let (session, lines) = collecting_session(SessionConfig::default());

    session.start(Path::new(SAMPLE), &[]).expect("start");
    session.execute_command("progress 1").unwrap();
    session.execute_command("bogus").unwrap();
    session.execute_command("exit").unwrap();

    assert!(wait_until(Duration::from_secs(10), || session.has_exited()));
    assert_eq!(session.close(), Some(ShutdownOutcome::Exited));
    session.dispose();

    let lines = lines.lock().unwrap().clone();
    assert!(lines.contains(&"sample.bin 100%".to_string()));
    assert!(lines.contains(&"Unknown command: bogus".to_string()));
}

#[test]
fn test_abort_cancels_waiting_child() {
    let (session, _lines) = collecting_session(SessionConfig::default());
    session.start(Path::new(SAMPLE), &[]).expect("start");

    // The child now blocks on an input prompt with nothing queued.
    thread::sleep(Duration::from_millis(200));
    session.abort();

    assert!(wait_until(Duration::from_secs(5), || session.has_exited()));
    session.dispose();
    assert!(session.take_dispatch_error().is_none());
}

#[test]
fn test_host_reports_version() {
    let output = std::process::Command::new(env!("CARGO_BIN_EXE_console-bridge"))
        .arg("--version")
        .output()
        .expect("run host");
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.lines().next(),
        Some(format!("console-bridge {}", console_bridge::get_version()).as_str())
    );
}
