use log::{debug, warn};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc;
use nix::sys::mman::{mmap, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::signal::{killpg, Signal};
use nix::sys::stat::Mode;
use nix::unistd::{ftruncate, Pid, User};
use std::ffi::{c_void, CString};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::ptr::NonNull;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::process::{ChildProcess, LaunchSpec};
use crate::security::{AccessControl, Identity};

const OBJECT_MODE: libc::c_uint = 0o600;

fn c_name(name: &str) -> io::Result<CString> {
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "object name contains NUL"))
}

/// Named auto-reset signal backed by a POSIX named semaphore.
pub struct NamedEvent {
    sem: *mut libc::sem_t,
    name: String,
    owner: bool,
}

// sem_t operations are thread-safe.
unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    /// Create a new, unsignalled event. `Ok(None)` when the name is taken.
    pub fn create(name: &str, identity: Option<&Identity>) -> Result<Option<Self>> {
        let creation_error = |source| BridgeError::ResourceCreation {
            kind: "event",
            name: name.to_string(),
            source,
        };
        let cname = c_name(name).map_err(creation_error)?;

        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_CREAT | libc::O_EXCL,
                OBJECT_MODE,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EEXIST) {
                return Ok(None);
            }
            return Err(creation_error(err));
        }

        let event = Self {
            sem,
            name: name.to_string(),
            owner: true,
        };
        if let Some(identity) = identity {
            grant_semaphore(name, identity)?;
        }
        Ok(Some(event))
    }

    /// Attach to an event created by another process.
    pub fn open(name: &str) -> Result<Self> {
        let open_error = |source| BridgeError::ResourceOpen {
            kind: "event",
            name: name.to_string(),
            source,
        };
        let cname = c_name(name).map_err(open_error)?;

        let sem = unsafe { libc::sem_open(cname.as_ptr(), 0) };
        if sem == libc::SEM_FAILED {
            return Err(open_error(io::Error::last_os_error()));
        }
        Ok(Self {
            sem,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> Result<()> {
        if unsafe { libc::sem_post(self.sem) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }

    /// Wait until signalled or `timeout` passes. Returns whether it was signalled.
    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        Ok(timed_wait(self.sem, timeout)?)
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        unsafe {
            if libc::sem_close(self.sem) != 0 {
                warn!(
                    "[CHANNEL] Failed to close event {}: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
        }
        if self.owner {
            if let Ok(cname) = c_name(&self.name) {
                unsafe {
                    libc::sem_unlink(cname.as_ptr());
                }
            }
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
fn timed_wait(sem: *mut libc::sem_t, timeout: Duration) -> io::Result<bool> {
    let mut deadline: libc::timespec = unsafe { std::mem::zeroed() };
    unsafe {
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut deadline);
    }
    let nanos = deadline.tv_nsec as i64 + i64::from(timeout.subsec_nanos());
    deadline.tv_sec += (timeout.as_secs() as i64 + nanos / 1_000_000_000) as libc::time_t;
    deadline.tv_nsec = (nanos % 1_000_000_000) as _;

    loop {
        if unsafe { libc::sem_timedwait(sem, &deadline) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => return Ok(false),
            Some(libc::EINTR) => continue,
            _ => return Err(err),
        }
    }
}

// No sem_timedwait: poll with sem_trywait.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
fn timed_wait(sem: *mut libc::sem_t, timeout: Duration) -> io::Result<bool> {
    let deadline = std::time::Instant::now() + timeout;
    loop {
        if unsafe { libc::sem_trywait(sem) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EAGAIN) | Some(libc::EINTR) => {}
            _ => return Err(err),
        }
        if std::time::Instant::now() >= deadline {
            return Ok(false);
        }
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[cfg(target_os = "linux")]
fn grant_semaphore(name: &str, identity: &Identity) -> Result<()> {
    // glibc keeps named semaphores as /dev/shm/sem.<name>
    let path = format!("/dev/shm/sem.{}", name.trim_start_matches('/'));
    std::os::unix::fs::chown(&path, Some(identity.uid), Some(identity.gid)).map_err(|e| {
        BridgeError::AccessGrant {
            target: name.to_string(),
            reason: e.to_string(),
        }
    })
}

#[cfg(not(target_os = "linux"))]
fn grant_semaphore(name: &str, identity: &Identity) -> Result<()> {
    warn!(
        "[CHANNEL] Cannot change owner of semaphore {} to {} on this platform",
        name, identity.account
    );
    Ok(())
}

/// Named shared memory region mapped read/write.
pub struct SharedSegment {
    ptr: NonNull<c_void>,
    len: usize,
    name: String,
    owner: bool,
}

// Access to the mapped bytes is coordinated by the channel signals.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create a zero-filled segment. An existing segment of that name is an error.
    pub fn create(name: &str, size: usize, identity: Option<&Identity>) -> Result<Self> {
        let fd = match shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        ) {
            Ok(fd) => fd,
            Err(Errno::EEXIST) => {
                return Err(BridgeError::ResourceExists {
                    kind: "shared memory",
                    name: name.to_string(),
                })
            }
            Err(errno) => {
                return Err(BridgeError::ResourceCreation {
                    kind: "shared memory",
                    name: name.to_string(),
                    source: errno.into(),
                })
            }
        };

        let mapped = (|| -> Result<NonNull<c_void>> {
            if let Some(identity) = identity {
                std::os::unix::fs::fchown(&fd, Some(identity.uid), Some(identity.gid)).map_err(
                    |e| BridgeError::AccessGrant {
                        target: name.to_string(),
                        reason: e.to_string(),
                    },
                )?;
            }
            ftruncate(&fd, size as libc::off_t).map_err(|errno| {
                BridgeError::ResourceCreation {
                    kind: "shared memory",
                    name: name.to_string(),
                    source: errno.into(),
                }
            })?;
            map(&fd, size).map_err(|source| BridgeError::ResourceCreation {
                kind: "shared memory",
                name: name.to_string(),
                source,
            })
        })();

        match mapped {
            Ok(ptr) => Ok(Self {
                ptr,
                len: size,
                name: name.to_string(),
                owner: true,
            }),
            Err(e) => {
                let _ = shm_unlink(name);
                Err(e)
            }
        }
    }

    pub fn open(name: &str, size: usize) -> Result<Self> {
        let open_error = |source| BridgeError::ResourceOpen {
            kind: "shared memory",
            name: name.to_string(),
            source,
        };
        let fd = shm_open(name, OFlag::O_RDWR, Mode::empty())
            .map_err(|errno| open_error(errno.into()))?;
        let ptr = map(&fd, size).map_err(open_error)?;
        Ok(Self {
            ptr,
            len: size,
            name: name.to_string(),
            owner: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr().cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

fn map(fd: &std::os::fd::OwnedFd, size: usize) -> io::Result<NonNull<c_void>> {
    let length = NonZeroUsize::new(size)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty segment"))?;
    // SAFETY: fresh mapping of a descriptor we own, no address hint.
    unsafe {
        mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(io::Error::from)
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // SAFETY: ptr/len describe the mapping created in create/open.
        if let Err(errno) = unsafe { munmap(self.ptr, self.len) } {
            warn!("[CHANNEL] Failed to unmap {}: {}", self.name, errno);
        }
        if self.owner {
            if let Err(errno) = shm_unlink(self.name.as_str()) {
                warn!("[CHANNEL] Failed to unlink {}: {}", self.name, errno);
            }
        }
    }
}

/// Process group whose members are killed when the group is released.
pub struct ProcessGroup {
    name: String,
    leader: Mutex<Option<Pid>>,
}

impl ProcessGroup {
    pub fn create(name: &str) -> Result<Self> {
        debug!("[PROCESS] Process group {} prepared", name);
        Ok(Self {
            name: name.to_string(),
            leader: Mutex::new(None),
        })
    }

    /// Make the child the leader of a new group.
    pub fn prepare(&self, command: &mut Command) {
        command.process_group(0);
    }

    pub fn assign(&self, pid: u32) -> Result<()> {
        let mut leader = self
            .leader
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *leader = Some(Pid::from_raw(pid as libc::pid_t));
        debug!("[PROCESS] Process {} assigned to group {}", pid, self.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let leader = self
            .leader
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(pgid) = leader {
            match killpg(pgid, Signal::SIGKILL) {
                Ok(()) => debug!("[PROCESS] Killed process group {}", pgid),
                Err(Errno::ESRCH) => {}
                Err(errno) => warn!("[PROCESS] Failed to kill process group {}: {}", pgid, errno),
            }
        }
    }
}

pub struct PlatformAccess;

impl AccessControl for PlatformAccess {
    fn resolve(&self, account: &str) -> Result<Identity> {
        match User::from_name(account) {
            Ok(Some(user)) => Ok(Identity {
                account: user.name,
                uid: user.uid.as_raw(),
                gid: user.gid.as_raw(),
                home: user.dir,
            }),
            Ok(None) => Err(BridgeError::IdentityResolution {
                user: account.to_string(),
                reason: "no such account".to_string(),
            }),
            Err(errno) => Err(BridgeError::IdentityResolution {
                user: account.to_string(),
                reason: errno.to_string(),
            }),
        }
    }

    fn grant_window_station(&self, _identity: &Identity) -> Result<()> {
        Ok(())
    }

    fn grant_desktop(&self, _identity: &Identity) -> Result<()> {
        Ok(())
    }
}

/// Start the child as `identity` with that user's environment.
pub fn spawn_as_user(
    spec: &LaunchSpec,
    group: Option<&ProcessGroup>,
    identity: &Identity,
    password: Option<&str>,
) -> io::Result<Box<dyn ChildProcess>> {
    if password.is_some() {
        debug!("[PROCESS] Password ignored, switching user by uid");
    }
    let mut command = spec.command();
    if let Some(group) = group {
        group.prepare(&mut command);
    }
    command
        .uid(identity.uid)
        .gid(identity.gid)
        .env("HOME", &identity.home)
        .env("USER", &identity.account)
        .env("LOGNAME", &identity.account);
    Ok(Box::new(command.spawn()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ENVELOPE_SIZE;
    use std::sync::Arc;
    use std::thread;

    fn unique(label: &str) -> String {
        format!("/cbtest-{}-{}-{}", label, std::process::id(), rand::random::<u32>())
    }

    #[test]
    fn test_event_create_is_exclusive() {
        let name = unique("excl");
        let first = NamedEvent::create(&name, None).expect("create");
        assert!(first.is_some());
        assert!(NamedEvent::create(&name, None).expect("second create").is_none());

        drop(first);
        assert!(NamedEvent::create(&name, None).expect("after unlink").is_some());
    }

    #[test]
    fn test_event_wait_times_out() {
        let event = NamedEvent::create(&unique("timeout"), None)
            .expect("create")
            .expect("unique");
        let started = std::time::Instant::now();
        assert!(!event.wait(Duration::from_millis(30)).expect("wait"));
        assert!(started.elapsed() >= Duration::from_millis(25));
    }

    #[test]
    fn test_event_signal_across_handles() {
        let name = unique("signal");
        let owner = NamedEvent::create(&name, None).expect("create").expect("unique");
        let attached = Arc::new(NamedEvent::open(&name).expect("open"));

        let setter = {
            let attached = Arc::clone(&attached);
            thread::spawn(move || attached.set().expect("set"))
        };
        assert!(owner.wait(Duration::from_secs(5)).expect("wait"));
        setter.join().expect("setter");

        // Auto-reset: consumed by the first wait.
        assert!(!owner.wait(Duration::from_millis(10)).expect("wait"));
    }

    #[test]
    fn test_open_missing_event_fails() {
        let err = NamedEvent::open(&unique("missing"))
            .err()
            .expect("nothing to open");
        assert!(matches!(err, BridgeError::ResourceOpen { kind: "event", .. }));
    }

    #[test]
    fn test_segment_is_shared_and_exclusive() {
        let name = unique("shm");
        let owner = SharedSegment::create(&name, ENVELOPE_SIZE, None).expect("create");
        let err = SharedSegment::create(&name, ENVELOPE_SIZE, None)
            .err()
            .expect("second create fails");
        assert!(matches!(err, BridgeError::ResourceExists { .. }));

        let attached = SharedSegment::open(&name, ENVELOPE_SIZE).expect("open");
        unsafe {
            assert_eq!(*owner.as_ptr().add(100), 0);
            *owner.as_ptr().add(100) = 0xAB;
            assert_eq!(*attached.as_ptr().add(100), 0xAB);
        }
    }

    #[test]
    fn test_process_group_kills_leader() {
        let group = ProcessGroup::create("cbtest-group").expect("group");
        let mut command = Command::new("sleep");
        command.arg("30");
        group.prepare(&mut command);
        let mut child = command.spawn().expect("spawn sleep");
        group.assign(child.id()).expect("assign");

        drop(group);
        let status = child.wait().expect("wait");
        assert!(!status.success());
    }
}
