use log::{debug, warn};
use std::ffi::OsStr;
use std::io;
use std::iter::once;
use std::mem::size_of;
use std::os::windows::ffi::OsStrExt;
use std::process::Command;
use std::time::Duration;

use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, GetLastError, LocalFree, ERROR_ALREADY_EXISTS, ERROR_INSUFFICIENT_BUFFER,
    GENERIC_ALL, HANDLE, HLOCAL, INVALID_HANDLE_VALUE, WAIT_OBJECT_0, WAIT_TIMEOUT,
};
use windows::Win32::Security::Authorization::{
    GetSecurityInfo, SetEntriesInAclW, SetSecurityInfo, EXPLICIT_ACCESS_W, GRANT_ACCESS,
    NO_MULTIPLE_TRUSTEE, SE_KERNEL_OBJECT, SE_OBJECT_TYPE, SE_WINDOW_OBJECT, TRUSTEE_IS_SID,
    TRUSTEE_IS_USER, TRUSTEE_W,
};
use windows::Win32::Security::{
    LookupAccountNameW, ACL, DACL_SECURITY_INFORMATION, NO_INHERITANCE, PSECURITY_DESCRIPTOR,
    PSID, SID_NAME_USE,
};
use windows::Win32::System::JobObjects::{
    AssignProcessToJobObject, CreateJobObjectW, JobObjectExtendedLimitInformation,
    SetInformationJobObject, JOBOBJECT_EXTENDED_LIMIT_INFORMATION,
    JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE,
};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};
use windows::Win32::System::StationsAndDesktops::{GetProcessWindowStation, GetThreadDesktop};
use windows::Win32::System::Threading::{
    CreateEventW, CreateProcessWithLogonW, GetCurrentThreadId, GetExitCodeProcess, OpenEventW,
    OpenProcess, SetEvent, TerminateProcess, WaitForSingleObject, CREATE_UNICODE_ENVIRONMENT,
    EVENT_ALL_ACCESS, LOGON_WITH_PROFILE, PROCESS_ALL_ACCESS, PROCESS_INFORMATION, STARTUPINFOW,
};

use crate::error::{BridgeError, Result};
use crate::process::{ChildProcess, LaunchSpec};
use crate::security::{AccessControl, Identity};

const STILL_ACTIVE: u32 = 259;

fn to_wide(s: &str) -> Vec<u16> {
    OsStr::new(s).encode_wide().chain(once(0)).collect()
}

fn last_error() -> io::Error {
    io::Error::last_os_error()
}

fn win32_error(error: windows::core::Error) -> io::Error {
    io::Error::from_raw_os_error(error.code().0 & 0xFFFF)
}

/// Add an ACE granting `sid` full access to the object behind `handle`.
fn grant_object(handle: HANDLE, object_type: SE_OBJECT_TYPE, sid: &[u8]) -> io::Result<()> {
    unsafe {
        let mut old_dacl: *mut ACL = std::ptr::null_mut();
        let mut descriptor = PSECURITY_DESCRIPTOR::default();
        GetSecurityInfo(
            handle,
            object_type,
            DACL_SECURITY_INFORMATION,
            None,
            None,
            Some(&mut old_dacl),
            None,
            Some(&mut descriptor),
        )
        .ok()
        .map_err(win32_error)?;

        let entry = EXPLICIT_ACCESS_W {
            grfAccessPermissions: GENERIC_ALL.0,
            grfAccessMode: GRANT_ACCESS,
            grfInheritance: NO_INHERITANCE,
            Trustee: TRUSTEE_W {
                pMultipleTrustee: std::ptr::null_mut(),
                MultipleTrusteeOperation: NO_MULTIPLE_TRUSTEE,
                TrusteeForm: TRUSTEE_IS_SID,
                TrusteeType: TRUSTEE_IS_USER,
                ptstrName: PWSTR(sid.as_ptr() as *mut u16),
            },
        };

        let mut new_dacl: *mut ACL = std::ptr::null_mut();
        let result = SetEntriesInAclW(Some(&[entry]), Some(old_dacl), &mut new_dacl)
            .ok()
            .map_err(win32_error)
            .and_then(|()| {
                SetSecurityInfo(
                    handle,
                    object_type,
                    DACL_SECURITY_INFORMATION,
                    None,
                    None,
                    Some(new_dacl),
                    None,
                )
                .ok()
                .map_err(win32_error)
            });

        if !new_dacl.is_null() {
            let _ = LocalFree(Some(HLOCAL(new_dacl.cast())));
        }
        if !descriptor.0.is_null() {
            let _ = LocalFree(Some(HLOCAL(descriptor.0)));
        }
        result
    }
}

fn grant_kernel_object(handle: HANDLE, name: &str, identity: Option<&Identity>) -> Result<()> {
    if let Some(identity) = identity {
        grant_object(handle, SE_KERNEL_OBJECT, &identity.sid).map_err(|e| {
            BridgeError::AccessGrant {
                target: name.to_string(),
                reason: e.to_string(),
            }
        })?;
    }
    Ok(())
}

/// Named auto-reset event.
pub struct NamedEvent {
    handle: HANDLE,
    name: String,
}

unsafe impl Send for NamedEvent {}
unsafe impl Sync for NamedEvent {}

impl NamedEvent {
    /// Create a new, unsignalled event. `Ok(None)` when the name is taken.
    pub fn create(name: &str, identity: Option<&Identity>) -> Result<Option<Self>> {
        let wide_name = to_wide(name);
        unsafe {
            let handle = CreateEventW(
                None,
                false.into(), // auto reset
                false.into(),
                PCWSTR(wide_name.as_ptr()),
            )
            .map_err(|e| BridgeError::ResourceCreation {
                kind: "event",
                name: name.to_string(),
                source: win32_error(e),
            })?;

            if GetLastError() == ERROR_ALREADY_EXISTS {
                let _ = CloseHandle(handle);
                return Ok(None);
            }

            let event = Self {
                handle,
                name: name.to_string(),
            };
            grant_kernel_object(handle, name, identity)?;
            Ok(Some(event))
        }
    }

    pub fn open(name: &str) -> Result<Self> {
        let wide_name = to_wide(name);
        let handle = unsafe { OpenEventW(EVENT_ALL_ACCESS, false, PCWSTR(wide_name.as_ptr())) }
            .map_err(|e| BridgeError::ResourceOpen {
                kind: "event",
                name: name.to_string(),
                source: win32_error(e),
            })?;
        Ok(Self {
            handle,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set(&self) -> Result<()> {
        unsafe { SetEvent(self.handle) }.map_err(win32_error)?;
        Ok(())
    }

    pub fn wait(&self, timeout: Duration) -> Result<bool> {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX - 1);
        match unsafe { WaitForSingleObject(self.handle, millis) } {
            WAIT_OBJECT_0 => Ok(true),
            WAIT_TIMEOUT => Ok(false),
            _ => Err(last_error().into()),
        }
    }
}

impl Drop for NamedEvent {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = CloseHandle(self.handle) {
                warn!("[CHANNEL] Failed to close event {}: {}", self.name, e);
            }
        }
    }
}

/// Named file mapping backed by the paging file.
pub struct SharedSegment {
    mapping: HANDLE,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
    name: String,
}

unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    pub fn create(name: &str, size: usize, identity: Option<&Identity>) -> Result<Self> {
        let wide_name = to_wide(name);
        let creation_error = |source| BridgeError::ResourceCreation {
            kind: "shared memory",
            name: name.to_string(),
            source,
        };

        unsafe {
            let mapping = CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                None,
                PAGE_READWRITE,
                0,
                size as u32,
                PCWSTR(wide_name.as_ptr()),
            )
            .map_err(|e| creation_error(win32_error(e)))?;

            if GetLastError() == ERROR_ALREADY_EXISTS {
                let _ = CloseHandle(mapping);
                return Err(BridgeError::ResourceExists {
                    kind: "shared memory",
                    name: name.to_string(),
                });
            }

            if let Err(e) = grant_kernel_object(mapping, name, identity) {
                let _ = CloseHandle(mapping);
                return Err(e);
            }

            let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size);
            if view.Value.is_null() {
                let err = last_error();
                let _ = CloseHandle(mapping);
                return Err(creation_error(err));
            }

            Ok(Self {
                mapping,
                view,
                len: size,
                name: name.to_string(),
            })
        }
    }

    pub fn open(name: &str, size: usize) -> Result<Self> {
        let wide_name = to_wide(name);
        let open_error = |source| BridgeError::ResourceOpen {
            kind: "shared memory",
            name: name.to_string(),
            source,
        };

        unsafe {
            let mapping =
                OpenFileMappingW(FILE_MAP_ALL_ACCESS.0, false, PCWSTR(wide_name.as_ptr()))
                    .map_err(|e| open_error(win32_error(e)))?;
            let view = MapViewOfFile(mapping, FILE_MAP_ALL_ACCESS, 0, 0, size);
            if view.Value.is_null() {
                let err = last_error();
                let _ = CloseHandle(mapping);
                return Err(open_error(err));
            }
            Ok(Self {
                mapping,
                view,
                len: size,
                name: name.to_string(),
            })
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.view.Value.cast()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = UnmapViewOfFile(self.view) {
                warn!("[CHANNEL] Failed to unmap {}: {}", self.name, e);
            }
            let _ = CloseHandle(self.mapping);
        }
    }
}

/// Job object killing every assigned process when closed.
pub struct ProcessGroup {
    handle: HANDLE,
    name: String,
}

unsafe impl Send for ProcessGroup {}
unsafe impl Sync for ProcessGroup {}

impl ProcessGroup {
    pub fn create(name: &str) -> Result<Self> {
        let wide_name = to_wide(name);
        let creation_error = |source| BridgeError::ResourceCreation {
            kind: "job",
            name: name.to_string(),
            source,
        };

        unsafe {
            let handle = CreateJobObjectW(None, PCWSTR(wide_name.as_ptr()))
                .map_err(|e| creation_error(win32_error(e)))?;

            let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = std::mem::zeroed();
            info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;

            if let Err(e) = SetInformationJobObject(
                handle,
                JobObjectExtendedLimitInformation,
                (&raw const info).cast(),
                size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as u32,
            ) {
                let _ = CloseHandle(handle);
                return Err(creation_error(win32_error(e)));
            }

            debug!("[PROCESS] Job object {} created", name);
            Ok(Self {
                handle,
                name: name.to_string(),
            })
        }
    }

    pub fn prepare(&self, _command: &mut Command) {}

    pub fn assign(&self, pid: u32) -> Result<()> {
        unsafe {
            let process = OpenProcess(PROCESS_ALL_ACCESS, false, pid)
                .map_err(|e| BridgeError::Io(win32_error(e)))?;
            let result = AssignProcessToJobObject(self.handle, process);
            let _ = CloseHandle(process);
            result.map_err(|e| BridgeError::Io(win32_error(e)))?;
        }
        debug!("[PROCESS] Process {} assigned to job {}", pid, self.name);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.handle);
        }
    }
}

pub struct PlatformAccess;

impl AccessControl for PlatformAccess {
    fn resolve(&self, account: &str) -> Result<Identity> {
        let resolution_error = |reason: String| BridgeError::IdentityResolution {
            user: account.to_string(),
            reason,
        };
        let wide_account = to_wide(account);
        let mut sid_size = 0u32;
        let mut domain_size = 0u32;
        let mut use_kind = SID_NAME_USE::default();

        unsafe {
            if let Err(e) = LookupAccountNameW(
                PCWSTR::null(),
                PCWSTR(wide_account.as_ptr()),
                None,
                &mut sid_size,
                None,
                &mut domain_size,
                &mut use_kind,
            ) {
                if GetLastError() != ERROR_INSUFFICIENT_BUFFER {
                    return Err(resolution_error(e.message()));
                }
            }

            let mut sid = vec![0u8; sid_size as usize];
            let mut domain = vec![0u16; domain_size as usize];
            LookupAccountNameW(
                PCWSTR::null(),
                PCWSTR(wide_account.as_ptr()),
                Some(PSID(sid.as_mut_ptr().cast())),
                &mut sid_size,
                Some(PWSTR(domain.as_mut_ptr())),
                &mut domain_size,
                &mut use_kind,
            )
            .map_err(|e| resolution_error(e.message()))?;

            Ok(Identity {
                account: account.to_string(),
                sid,
            })
        }
    }

    fn grant_window_station(&self, identity: &Identity) -> Result<()> {
        unsafe {
            let station = GetProcessWindowStation().map_err(|e| BridgeError::AccessGrant {
                target: "window station".to_string(),
                reason: e.message(),
            })?;
            grant_object(HANDLE(station.0), SE_WINDOW_OBJECT, &identity.sid).map_err(|e| {
                BridgeError::AccessGrant {
                    target: "window station".to_string(),
                    reason: e.to_string(),
                }
            })
        }
    }

    fn grant_desktop(&self, identity: &Identity) -> Result<()> {
        unsafe {
            let desktop =
                GetThreadDesktop(GetCurrentThreadId()).map_err(|e| BridgeError::AccessGrant {
                    target: "desktop".to_string(),
                    reason: e.message(),
                })?;
            grant_object(HANDLE(desktop.0), SE_WINDOW_OBJECT, &identity.sid).map_err(|e| {
                BridgeError::AccessGrant {
                    target: "desktop".to_string(),
                    reason: e.to_string(),
                }
            })
        }
    }
}

/// Child started through CreateProcessWithLogonW.
struct LogonChild {
    process: HANDLE,
    pid: u32,
}

unsafe impl Send for LogonChild {}

impl ChildProcess for LogonChild {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        let mut code = 0u32;
        unsafe { GetExitCodeProcess(self.process, &mut code) }.map_err(win32_error)?;
        if code == STILL_ACTIVE {
            return Ok(None);
        }
        Ok(Some(code as i32))
    }

    fn kill(&mut self) -> io::Result<()> {
        unsafe { TerminateProcess(self.process, 1) }.map_err(win32_error)
    }
}

impl Drop for LogonChild {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.process);
        }
    }
}

fn quote_argument(argument: &str) -> String {
    if !argument.is_empty() && !argument.contains([' ', '\t', '"']) {
        return argument.to_string();
    }
    format!("\"{}\"", argument.replace('"', "\\\""))
}

/// Start the child under `identity`, loading its profile.
pub fn spawn_as_user(
    spec: &LaunchSpec,
    _group: Option<&ProcessGroup>,
    identity: &Identity,
    password: Option<&str>,
) -> io::Result<Box<dyn ChildProcess>> {
    let (domain, user) = match identity.account.split_once('\\') {
        Some((domain, user)) => (Some(domain), user),
        None => (None, identity.account.as_str()),
    };
    let wide_user = to_wide(user);
    let wide_domain = domain.map(to_wide);
    let wide_password = to_wide(password.unwrap_or_default());
    let executable = spec.executable.to_string_lossy().to_string();
    let wide_executable = to_wide(&executable);
    let mut command_line: Vec<u16> = to_wide(
        &once(quote_argument(&executable))
            .chain(spec.arguments.iter().map(|a| quote_argument(a)))
            .collect::<Vec<_>>()
            .join(" "),
    );
    let wide_directory = to_wide(&spec.working_directory.to_string_lossy());

    let startup = STARTUPINFOW {
        cb: size_of::<STARTUPINFOW>() as u32,
        ..Default::default()
    };
    let mut info = PROCESS_INFORMATION::default();

    unsafe {
        CreateProcessWithLogonW(
            PCWSTR(wide_user.as_ptr()),
            wide_domain
                .as_ref()
                .map_or(PCWSTR::null(), |d| PCWSTR(d.as_ptr())),
            PCWSTR(wide_password.as_ptr()),
            LOGON_WITH_PROFILE,
            PCWSTR(wide_executable.as_ptr()),
            Some(PWSTR(command_line.as_mut_ptr())),
            CREATE_UNICODE_ENVIRONMENT,
            None,
            PCWSTR(wide_directory.as_ptr()),
            &startup,
            &mut info,
        )
        .map_err(win32_error)?;
        let _ = CloseHandle(info.hThread);
    }

    Ok(Box::new(LogonChild {
        process: info.hProcess,
        pid: info.dwProcessId,
    }))
}
