// Runs a console child under a ConsoleSession: stdin lines become commands,
// assembled output lines go to stdout, progress is logged as JSON.

use console_bridge::logging::{get_crash_log_path, init_crash_logger, init_logger};
use console_bridge::{get_version, ConsoleSession, SessionConfig, ShutdownOutcome};
use log::{error, info, warn};
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const CONFIG_ENV: &str = "CONSOLE_BRIDGE_CONFIG";

fn load_config() -> Result<SessionConfig, Box<dyn std::error::Error>> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) => Ok(SessionConfig::from_json_file(Path::new(&path))?),
        None => Ok(SessionConfig::load_default()?),
    }
}

fn run() -> Result<i32, Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let executable = match args.next() {
        Some(flag) if flag == "--version" => {
            println!("console-bridge {}", get_version());
            if let Some(path) = get_crash_log_path() {
                println!("crash log: {}", path);
            }
            return Ok(0);
        }
        Some(executable) => PathBuf::from(executable),
        None => {
            return Err(format!(
                "usage: console-bridge --version | <executable> [arguments...] (config via {})",
                CONFIG_ENV
            )
            .into())
        }
    };
    let arguments: Vec<String> = args.collect();

    let config = load_config()?;
    let session = Arc::new(ConsoleSession::new(config));
    session.set_output_sink(|line| println!("{}", line));
    session.set_progress_sink(|progress| match serde_json::to_string(progress) {
        Ok(json) => info!("[HOST] Progress {}", json),
        Err(e) => warn!("[HOST] Cannot serialize progress: {}", e),
    });

    session.start(&executable, &arguments)?;

    let input_closed = Arc::new(AtomicBool::new(false));
    {
        let session = Arc::clone(&session);
        let input_closed = Arc::clone(&input_closed);
        thread::spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("[HOST] Cannot read stdin: {}", e);
                        break;
                    }
                };
                if let Err(e) = session.execute_command(&line) {
                    error!("[HOST] {}", e);
                }
            }
            input_closed.store(true, Ordering::Release);
        });
    }

    while !session.has_exited() && !input_closed.load(Ordering::Acquire) {
        thread::sleep(Duration::from_millis(100));
    }

    if let Some(ShutdownOutcome::Killed) = session.close() {
        warn!("[HOST] Child had to be killed");
    }
    session.dispose();

    if let Some(e) = session.take_dispatch_error() {
        return Err(e.into());
    }
    Ok(session.exit_code().unwrap_or(1))
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    init_logger();
    init_crash_logger();

    match run() {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(e) => {
            eprintln!("console-bridge: {}", e);
            ExitCode::FAILURE
        }
    }
}
