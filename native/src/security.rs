//! Account resolution and access grants for running the child as another user.

#[cfg(unix)]
use std::path::PathBuf;

use crate::error::Result;

/// A resolved account the child will run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub account: String,
    #[cfg(unix)]
    pub uid: u32,
    #[cfg(unix)]
    pub gid: u32,
    #[cfg(unix)]
    pub home: PathBuf,
    /// Binary SID.
    #[cfg(windows)]
    pub sid: Vec<u8>,
}

/// Grants an identity access to the objects a console child needs.
///
/// Platforms without window stations and desktops implement the grants as
/// no-ops. Per-object grants for channel primitives are applied by the
/// platform layer when the primitives are created.
pub trait AccessControl: Send + Sync {
    fn resolve(&self, account: &str) -> Result<Identity>;
    fn grant_window_station(&self, identity: &Identity) -> Result<()>;
    fn grant_desktop(&self, identity: &Identity) -> Result<()>;
}

pub fn platform_access() -> Box<dyn AccessControl> {
    Box::new(crate::sys::PlatformAccess)
}
