use log::{debug, error, info, warn};
use once_cell::sync::OnceCell;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use crate::channel::{Channel, ChannelNegotiator};
use crate::config::SessionConfig;
use crate::dispatcher::{EventDispatcher, SessionHandler};
use crate::error::{BridgeError, Result};
use crate::input_queue::InputQueue;
use crate::process::{
    spawn_child, spawn_exit_watcher, LaunchSpec, ProcessHandle, RunAs, ShutdownOutcome,
};
use crate::protocol::TransferProgress;
use crate::security::{platform_access, AccessControl};
use crate::sinks::EventSinks;
use crate::sys::ProcessGroup;

/// Everything created by `start`, released by `dispose`.
#[derive(Default)]
struct SessionResources {
    started: bool,
    disposed: bool,
    channel: Option<Arc<Channel>>,
    group: Option<ProcessGroup>,
    dispatcher: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

/// Controller of one console child.
pub struct ConsoleSession {
    config: SessionConfig,
    access: Box<dyn AccessControl>,
    queue: Arc<InputQueue>,
    sinks: Arc<EventSinks>,
    abort: Arc<AtomicBool>,
    dispatch_error: Arc<Mutex<Option<BridgeError>>>,
    resources: Mutex<SessionResources>,
    // Read by the status accessors without the resource lock, which dispose
    // holds while tearing down.
    process: OnceCell<Arc<ProcessHandle>>,
    instance_name: Mutex<Option<String>>,
}

impl ConsoleSession {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_access_control(config, platform_access())
    }

    pub fn with_access_control(config: SessionConfig, access: Box<dyn AccessControl>) -> Self {
        Self {
            config,
            access,
            queue: Arc::new(InputQueue::new()),
            sinks: Arc::new(EventSinks::new()),
            abort: Arc::new(AtomicBool::new(false)),
            dispatch_error: Arc::new(Mutex::new(None)),
            resources: Mutex::new(SessionResources::default()),
            process: OnceCell::new(),
            instance_name: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionResources> {
        self.resources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn set_output_sink<F>(&self, sink: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.sinks.set_output(sink);
    }

    pub fn set_progress_sink<F>(&self, sink: F)
    where
        F: Fn(&TransferProgress) + Send + Sync + 'static,
    {
        self.sinks.set_progress(sink);
    }

    /// Negotiate a channel, spawn the child and start the event loop.
    /// Returns once both threads are running.
    pub fn start(&self, executable: &Path, arguments: &[String]) -> Result<()> {
        let mut resources = self.lock();
        if resources.disposed {
            return Err(BridgeError::NotStarted);
        }
        if resources.started {
            return Err(BridgeError::AlreadyStarted);
        }
        resources.started = true;

        let (identity, password) = match &self.config.run_as {
            Some(run_as) => (
                Some(self.access.resolve(&run_as.user)?),
                run_as.password.as_deref(),
            ),
            None => (None, None),
        };

        let mut negotiator = ChannelNegotiator::new(self.config.prefixes.clone())
            .with_max_attempts(self.config.max_name_attempts())
            .with_identity(identity.clone());
        let channel = Arc::new(negotiator.negotiate()?);
        *self
            .instance_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(channel.instance_name().to_string());
        resources.channel = Some(Arc::clone(&channel));

        if self.config.guard_with_job {
            resources.group = Some(ProcessGroup::create(&channel.names().job)?);
        }

        if let Some(identity) = &identity {
            self.access.grant_window_station(identity)?;
            self.access.grant_desktop(identity)?;
        }

        let spec = LaunchSpec::new(
            executable,
            arguments,
            &self.config,
            channel.instance_name(),
        );
        let run_as = identity.as_ref().map(|identity| RunAs { identity, password });
        let child = spawn_child(&spec, run_as, resources.group.as_ref())?;
        let process = Arc::new(ProcessHandle::new(child));
        let process_id = process.pid();
        let instance = channel.instance_name().to_string();
        if self.process.set(Arc::clone(&process)).is_err() {
            warn!("[SESSION] Process handle already recorded");
        }

        let poll_interval = self.config.poll_interval();
        resources.watcher = Some(spawn_exit_watcher(
            Arc::clone(&process),
            Arc::clone(&self.abort),
            poll_interval,
        )?);

        let handler = SessionHandler::new(
            Arc::clone(&self.queue),
            Arc::clone(&self.sinks),
            self.config.wants_progress,
            poll_interval,
        );
        let mut dispatcher = EventDispatcher::new(channel, handler, poll_interval);
        let abort = Arc::clone(&self.abort);
        let dispatch_error = Arc::clone(&self.dispatch_error);
        resources.dispatcher = Some(
            thread::Builder::new()
                .name("console-dispatcher".to_string())
                .spawn(move || {
                    let should_stop = || abort.load(Ordering::Acquire) || process.has_exited();
                    if let Err(e) = dispatcher.run(&should_stop) {
                        *dispatch_error
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner) = Some(e);
                    }
                })?,
        );

        info!(
            "[SESSION] Session started, child {} on channel {}",
            process_id, instance
        );
        Ok(())
    }

    /// Queue a command for the child's next input prompt.
    pub fn execute_command(&self, command: &str) -> Result<()> {
        self.queue.enqueue(command)?;
        debug!("[SESSION] Command queued");
        Ok(())
    }

    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    /// Stop the event loop and kill the child now.
    pub fn abort(&self) {
        let resources = self.lock();
        info!("[SESSION] Aborting");
        self.abort.store(true, Ordering::Release);

        if let Some(channel) = &resources.channel {
            if let Err(e) = channel.signal_cancel() {
                debug!("[SESSION] Cannot signal cancel: {}", e);
            }
        }
        if let Some(process) = self.process.get() {
            if let Err(e) = process.kill() {
                warn!("[SESSION] Failed to kill child: {}", e);
            }
        }
    }

    /// Wait for the child to exit on its own within the shutdown timeout,
    /// then kill it. `None` when no child was started.
    pub fn close(&self) -> Option<ShutdownOutcome> {
        let process = Arc::clone(self.process.get()?);
        let timeout = self.config.shutdown_timeout();

        if process.wait_for_exit(timeout).is_some() {
            return Some(ShutdownOutcome::Exited);
        }
        let _resources = self.lock();
        Some(process.force_close(timeout))
    }

    /// Release everything in order. Safe to call more than once.
    pub fn dispose(&self) {
        let (dispatcher, watcher) = {
            let mut resources = self.lock();
            if resources.disposed {
                return;
            }
            resources.disposed = true;
            self.abort.store(true, Ordering::Release);
            (resources.dispatcher.take(), resources.watcher.take())
        };

        // Joined without the resource lock: sinks run on the dispatcher
        // thread and may call back into the session.
        if let Some(dispatcher) = dispatcher {
            if dispatcher.join().is_err() {
                error!("[SESSION] Dispatcher thread panicked");
            }
        }
        if let Some(watcher) = watcher {
            if watcher.join().is_err() {
                error!("[SESSION] Exit watcher thread panicked");
            }
        }

        let mut resources = self.lock();
        if let Some(process) = self.process.get() {
            process.release();
        }
        if let Some(channel) = resources.channel.take() {
            match Arc::try_unwrap(channel) {
                Ok(channel) => channel.close(self.config.verify_handles_closed),
                Err(_) => warn!("[SESSION] Channel still referenced at dispose"),
            }
        }
        if let Some(group) = resources.group.take() {
            debug!("[SESSION] Releasing process group {}", group.name());
            drop(group);
        }

        info!("[SESSION] Disposed");
    }

    pub fn has_exited(&self) -> bool {
        self.process
            .get()
            .is_some_and(|process| process.has_exited())
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.process.get().and_then(|process| process.exit_code())
    }

    pub fn instance_name(&self) -> Option<String> {
        self.instance_name
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The error that ended the event loop, if any. Taken once.
    pub fn take_dispatch_error(&self) -> Option<BridgeError> {
        self.dispatch_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for ConsoleSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::client::{instance_from_args, ConsoleClient};
    use crate::config::{ChannelPrefixes, RunAsUser};
    use crate::protocol::{ConsoleEvent, EventReply, StdTransport};
    use crate::security::Identity;
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    const SH: &str = "/bin/sh";

    fn quick_config() -> SessionConfig {
        SessionConfig {
            shutdown_timeout_ms: Some(300),
            poll_interval_ms: 10,
            working_directory: Some(std::env::temp_dir()),
            ..SessionConfig::default()
        }
    }

    fn script(body: &str) -> Vec<String> {
        vec!["-c".to_string(), body.to_string()]
    }

    fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + limit;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let session = ConsoleSession::new(quick_config());
        session
            .start(Path::new(SH), &script("exit 0"))
            .expect("start");
        let err = session
            .start(Path::new(SH), &script("exit 0"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::AlreadyStarted));
    }

    #[test]
    fn test_exit_code_observed() {
        let session = ConsoleSession::new(quick_config());
        session
            .start(Path::new(SH), &script("exit 4"))
            .expect("start");
        assert!(wait_until(Duration::from_secs(5), || session.has_exited()));
        assert_eq!(session.exit_code(), Some(4));
        assert_eq!(session.close(), Some(ShutdownOutcome::Exited));
    }

    #[test]
    fn test_close_kills_hung_child() {
        let session = ConsoleSession::new(quick_config());
        session
            .start(Path::new(SH), &script("sleep 30"))
            .expect("start");

        let started = Instant::now();
        assert_eq!(session.close(), Some(ShutdownOutcome::Killed));
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(session.has_exited());
    }

    #[test]
    fn test_abort_kills_immediately() {
        let session = ConsoleSession::new(quick_config());
        session
            .start(Path::new(SH), &script("sleep 30"))
            .expect("start");
        session.abort();
        assert!(wait_until(Duration::from_secs(5), || session.has_exited()));
    }

    #[test]
    fn test_dispose_twice_is_safe() {
        let session = ConsoleSession::new(SessionConfig {
            verify_handles_closed: true,
            guard_with_job: true,
            ..quick_config()
        });
        session
            .start(Path::new(SH), &script("sleep 30"))
            .expect("start");
        let instance = session.instance_name().expect("instance name");

        session.dispose();
        session.dispose();

        assert!(ConsoleClient::attach(&instance, &ChannelPrefixes::default()).is_err());
        assert!(matches!(
            session.start(Path::new(SH), &script("exit 0")),
            Err(BridgeError::NotStarted)
        ));
    }

    #[test]
    fn test_dispose_kills_process_group() {
        use nix::errno::Errno;
        use nix::sys::signal::kill;
        use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
        use nix::unistd::Pid;

        let marker = tempfile::NamedTempFile::new().expect("temp file");
        let session = ConsoleSession::new(SessionConfig {
            guard_with_job: true,
            ..quick_config()
        });
        let body = format!(
            "sleep 30 & echo $$ $! > {}; wait",
            marker.path().display()
        );
        session.start(Path::new(SH), &script(&body)).expect("start");

        let mut pids = Vec::new();
        assert!(wait_until(Duration::from_secs(5), || {
            pids = std::fs::read_to_string(marker.path())
                .unwrap_or_default()
                .split_whitespace()
                .filter_map(|pid| pid.parse::<i32>().ok())
                .collect();
            pids.len() == 2
        }));
        let shell = Pid::from_raw(pids[0]);
        let sleeper = Pid::from_raw(pids[1]);

        session.dispose();

        // The shell is our child and stays a zombie until reaped here.
        assert!(wait_until(Duration::from_secs(5), || matches!(
            waitpid(shell, Some(WaitPidFlag::WNOHANG)),
            Ok(WaitStatus::Signaled(_, nix::sys::signal::Signal::SIGKILL, _))
        )));
        assert!(wait_until(Duration::from_secs(5), || kill(sleeper, None)
            == Err(Errno::ESRCH)));
        assert!(!session.has_exited());
    }

    #[test]
    fn test_sink_may_query_session_while_disposing() {
        use std::sync::mpsc;

        let session = Arc::new(ConsoleSession::new(quick_config()));
        let observed = Arc::new(Mutex::new(None));
        {
            let weak = Arc::downgrade(&session);
            let observed = Arc::clone(&observed);
            session.set_output_sink(move |_line| {
                thread::sleep(Duration::from_millis(200));
                if let Some(session) = weak.upgrade() {
                    *observed.lock().unwrap() = Some(session.exit_code());
                }
            });
        }

        session
            .start(Path::new(SH), &script("sleep 30"))
            .expect("start");
        let instance = session.instance_name().expect("instance name");
        let client = ConsoleClient::attach(&instance, &ChannelPrefixes::default())
            .expect("attach")
            .with_response_timeout(Some(Duration::from_secs(5)));
        let printer = thread::spawn(move || {
            client.send(&ConsoleEvent::Print {
                message: "line\n".to_string(),
                from_beginning: false,
            })
        });

        thread::sleep(Duration::from_millis(50));
        let (done_tx, done_rx) = mpsc::channel();
        {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                session.abort();
                session.dispose();
                let _ = done_tx.send(());
            });
        }

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(observed.lock().unwrap().is_some());
        printer.join().expect("printer thread").expect("print answered");
    }

    #[test]
    fn test_dispose_before_start() {
        let session = ConsoleSession::new(quick_config());
        session.dispose();
        assert_eq!(session.close(), None);
        assert!(!session.has_exited());
    }

    #[test]
    fn test_child_receives_instance_switch() {
        let marker = tempfile::NamedTempFile::new().expect("temp file");
        let session = ConsoleSession::new(quick_config());
        let body = format!("echo \"$@\" > {}", marker.path().display());
        session
            .start(Path::new(SH), &[script(&body), vec!["sh".to_string()]].concat())
            .expect("start");
        assert!(wait_until(Duration::from_secs(5), || session.has_exited()));

        let written = std::fs::read_to_string(marker.path()).expect("marker");
        let args: Vec<&str> = written.split_whitespace().collect();
        let expected = session.instance_name().expect("instance name");
        assert_eq!(
            instance_from_args(args.iter().copied(), &session.config().instance_switch),
            Some(expected)
        );
        assert!(args.contains(&session.config().console_switch.as_str()));
    }

    #[test]
    fn test_in_process_child_conversation() {
        let session = ConsoleSession::new(quick_config());
        let lines = Arc::new(Mutex::new(Vec::new()));
        let captured = Arc::clone(&lines);
        session.set_output_sink(move |line| captured.lock().unwrap().push(line.to_string()));

        session
            .start(Path::new(SH), &script("sleep 30"))
            .expect("start");
        let instance = session.instance_name().expect("instance name");
        let client = ConsoleClient::attach(&instance, &ChannelPrefixes::default())
            .expect("attach")
            .with_response_timeout(Some(Duration::from_secs(5)));

        assert_eq!(
            client.send(&ConsoleEvent::Init).expect("init"),
            EventReply::Init {
                input: StdTransport::Pipe,
                output: StdTransport::Pipe,
                wants_progress: false,
            }
        );
        session.execute_command("echo hi").expect("queue");
        assert_eq!(
            client
                .send(&ConsoleEvent::Input {
                    prompt: "> ".to_string(),
                    echo: true,
                })
                .expect("input"),
            EventReply::Input {
                accepted: true,
                answer: "echo hi".to_string(),
            }
        );
        client
            .send(&ConsoleEvent::Print {
                message: "hi\n".to_string(),
                from_beginning: false,
            })
            .expect("print");

        session.abort();
        session.dispose();
        assert_eq!(*lines.lock().unwrap(), vec!["echo hi", "hi"]);
        assert!(session.take_dispatch_error().is_none());
    }

    #[test]
    fn test_oversized_command_rejected() {
        let session = ConsoleSession::new(quick_config());
        let err = session
            .execute_command(&"x".repeat(crate::protocol::INPUT_CAPACITY))
            .unwrap_err();
        assert!(matches!(err, BridgeError::InputTooLong { .. }));

        let err = session.execute_command("rm a\0b").unwrap_err();
        assert!(matches!(err, BridgeError::InputContainsNul { position: 4 }));
        assert_eq!(session.pending_commands(), 0);
    }

    struct DenyingAccess;

    impl AccessControl for DenyingAccess {
        fn resolve(&self, account: &str) -> Result<Identity> {
            // The current user, so object ownership changes succeed.
            Ok(Identity {
                account: account.to_string(),
                uid: nix::unistd::getuid().as_raw(),
                gid: nix::unistd::getgid().as_raw(),
                home: PathBuf::from("/tmp"),
            })
        }

        fn grant_window_station(&self, _identity: &Identity) -> Result<()> {
            Err(BridgeError::AccessGrant {
                target: "window station".to_string(),
                reason: "denied".to_string(),
            })
        }

        fn grant_desktop(&self, _identity: &Identity) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_access_grant_failure_aborts_start() {
        let session = ConsoleSession::with_access_control(
            SessionConfig {
                run_as: Some(RunAsUser {
                    user: "operator".to_string(),
                    password: None,
                }),
                ..quick_config()
            },
            Box::new(DenyingAccess),
        );
        let err = session
            .start(Path::new(SH), &script("exit 0"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::AccessGrant { ref target, .. } if target == "window station"));
        assert!(!session.has_exited());
    }

    #[test]
    fn test_unknown_account_aborts_start() {
        let session = ConsoleSession::new(SessionConfig {
            run_as: Some(RunAsUser {
                user: "no-such-account-for-console-bridge".to_string(),
                password: None,
            }),
            ..quick_config()
        });
        let err = session
            .start(Path::new(SH), &script("exit 0"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::IdentityResolution { .. }));
    }
}
