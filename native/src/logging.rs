use log::{error, info, LevelFilter};
use once_cell::sync::OnceCell;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

static CRASH_LOG_PATH: OnceCell<PathBuf> = OnceCell::new();

/// Initialize env_logger. Defaults to `warn` unless `RUST_LOG` is set.
pub fn init_logger() {
    let mut builder = env_logger::Builder::from_default_env();

    if std::env::var("RUST_LOG").is_err() {
        builder.filter_level(LevelFilter::Warn);
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "[{}] {}: {}",
            record.level(),
            record.target(),
            record.args()
        )
    });

    let _ = builder.try_init();
}

/// Initialize crash logging and panic hook.
pub fn init_crash_logger() {
    let log_dir = if let Some(local_data) = dirs::data_local_dir() {
        local_data.join("ConsoleBridge")
    } else {
        PathBuf::from(".")
    };

    let _ = fs::create_dir_all(&log_dir);
    let log_path = log_dir.join("crash.log");
    if CRASH_LOG_PATH.set(log_path.clone()).is_err() {
        return;
    }

    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let crash_msg = format_panic_message(panic_info);

        if let Err(e) = write_crash_log(&crash_msg) {
            error!("[CRASH LOGGER] Failed to write crash log: {}", e);
        }

        error!("\n{}", crash_msg);
        previous(panic_info);
    }));

    info!("[CRASH LOGGER] Initialized - Log: {:?}", log_path);
}

/// Format panic message with timestamp, location, payload, and backtrace.
fn format_panic_message(panic_info: &std::panic::PanicHookInfo) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");

    let payload = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic payload".to_string()
    };

    let location = if let Some(location) = panic_info.location() {
        format!(
            "{}:{}:{}",
            location.file(),
            location.line(),
            location.column()
        )
    } else {
        "Unknown location".to_string()
    };

    format!(
        r#"
===== CONSOLE BRIDGE PANIC =====
Timestamp: {}
Location: {}
Message: {}
Thread: {:?}

Backtrace:
{:?}

"#,
        timestamp,
        location,
        payload,
        std::thread::current().name().unwrap_or("unnamed"),
        std::backtrace::Backtrace::capture()
    )
}

fn format_critical_error(context: &str, error: &str) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
    format!(
        r#"
===== CRITICAL ERROR =====
Timestamp: {}
Context: {}
Error: {}
Thread: {:?}

"#,
        timestamp,
        context,
        error,
        std::thread::current().name().unwrap_or("unnamed")
    )
}

/// Append a message to the crash log, if one was initialized.
fn write_crash_log(message: &str) -> std::io::Result<()> {
    if let Some(log_path) = CRASH_LOG_PATH.get() {
        append_to(log_path, message)?;
    }
    Ok(())
}

fn append_to(path: &Path, message: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", message)
}

/// Log a critical error to the crash log without panicking.
pub fn log_critical_error(context: &str, error: &str) {
    let message = format_critical_error(context, error);

    if let Err(e) = write_crash_log(&message) {
        error!("[CRASH LOGGER] Failed to write critical error: {}", e);
    }

    error!("{}", message);
}

/// Get the crash log file path
pub fn get_crash_log_path() -> Option<String> {
    CRASH_LOG_PATH
        .get()
        .map(|p| p.to_string_lossy().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_critical_error_report() {
        let report = format_critical_error("Console event loop", "Unknown console event 9");
        assert!(report.contains("Context: Console event loop"));
        assert!(report.contains("Error: Unknown console event 9"));
    }

    #[test]
    fn test_append_to_log_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("crash.log");
        append_to(&path, "first").expect("append");
        append_to(&path, "second").expect("append");
        let content = fs::read_to_string(&path).expect("read");
        assert_eq!(content, "first\nsecond\n");
    }

    #[test]
    fn test_log_critical_error_without_crash_log() {
        // Must not panic when only the logger is set up.
        init_logger();
        log_critical_error("test", "nothing to see");
    }
}
