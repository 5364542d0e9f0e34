use log::{debug, info, warn};
use once_cell::sync::OnceCell;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::ChildProcess;

const EXIT_POLL: Duration = Duration::from_millis(20);
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Exited,
    Killed,
    /// The handle was released before the child could be observed or killed.
    Released,
}

/// Shared handle to the running child. The exit code is recorded once and
/// the OS handle is released once.
pub struct ProcessHandle {
    pid: u32,
    child: Mutex<Option<Box<dyn ChildProcess>>>,
    exit_code: OnceCell<i32>,
}

impl ProcessHandle {
    pub fn new(child: Box<dyn ChildProcess>) -> Self {
        Self {
            pid: child.id(),
            child: Mutex::new(Some(child)),
            exit_code: OnceCell::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn ChildProcess>>> {
        self.child.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Check for termination, recording the exit code the first time.
    pub fn poll_exit(&self) -> Option<i32> {
        if let Some(code) = self.exit_code.get() {
            return Some(*code);
        }

        let mut guard = self.lock();
        let child = guard.as_mut()?;
        match child.try_wait() {
            Ok(Some(code)) => {
                if self.exit_code.set(code).is_ok() {
                    info!("[PROCESS] Process {} exited with code {}", self.pid, code);
                }
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("[PROCESS] Cannot query process {}: {}", self.pid, e);
                None
            }
        }
    }

    pub fn has_exited(&self) -> bool {
        self.poll_exit().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get().copied()
    }

    pub fn is_released(&self) -> bool {
        self.lock().is_none()
    }

    /// Forcibly terminate the child unless it has already exited.
    pub fn kill(&self) -> io::Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        let mut guard = self.lock();
        if let Some(child) = guard.as_mut() {
            info!("[PROCESS] Killing process {}", self.pid);
            child.kill()?;
        }
        Ok(())
    }

    /// Wait up to `timeout` for the child to exit. Gives up early once the
    /// handle is released.
    pub fn wait_for_exit(&self, timeout: Duration) -> Option<i32> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(code) = self.poll_exit() {
                return Some(code);
            }
            if self.is_released() {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            thread::sleep(EXIT_POLL.min(deadline - now));
        }
    }

    /// Give the child `timeout` to finish on its own, then kill it.
    pub fn close(&self, timeout: Duration) -> ShutdownOutcome {
        if self.wait_for_exit(timeout).is_some() {
            return ShutdownOutcome::Exited;
        }
        self.force_close(timeout)
    }

    /// Kill step of [`close`](Self::close), for callers that serialize it
    /// with other teardown.
    pub fn force_close(&self, waited: Duration) -> ShutdownOutcome {
        if self.has_exited() {
            return ShutdownOutcome::Exited;
        }
        {
            let mut guard = self.lock();
            let Some(child) = guard.as_mut() else {
                debug!("[PROCESS] Handle of process {} already released", self.pid);
                return ShutdownOutcome::Released;
            };
            warn!(
                "[PROCESS] Process {} did not exit within {:?}, killing",
                self.pid, waited
            );
            if let Err(e) = child.kill() {
                warn!("[PROCESS] Failed to kill process {}: {}", self.pid, e);
            }
        }
        self.wait_for_exit(REAP_TIMEOUT);
        ShutdownOutcome::Killed
    }

    /// Drop the OS handle. Later calls are no-ops.
    pub fn release(&self) {
        let child = self.lock().take();
        if child.is_some() {
            let state = if self.exit_code().is_some() {
                "exited"
            } else {
                "running"
            };
            debug!("[PROCESS] Released handle of {} process {}", state, self.pid);
        }
    }
}

/// Poll the child until it exits or `stop` is set, logging the exit code.
pub fn spawn_exit_watcher(
    process: Arc<ProcessHandle>,
    stop: Arc<AtomicBool>,
    interval: Duration,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("console-exit-watcher".to_string())
        .spawn(move || {
            while !stop.load(Ordering::Acquire) {
                if process.poll_exit().is_some() {
                    break;
                }
                thread::sleep(interval);
            }
        })
}
