// Named kernel objects, shared memory and process groups, per platform.
//
// Both backends expose the same names: NamedEvent, SharedSegment,
// ProcessGroup, PlatformAccess and spawn_as_user.

#[cfg(unix)]
mod posix;
#[cfg(unix)]
pub use posix::*;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use self::windows::*;

/// Full object name for `prefix` + `instance` in the platform namespace.
pub fn object_name(prefix: &str, instance: &str) -> String {
    if cfg!(unix) {
        format!("/{}{}", prefix, instance)
    } else {
        format!("{}{}", prefix, instance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_name() {
        let name = object_name("ConsoleBridgeEventRequest", "_1_a_2");
        assert!(name.ends_with("ConsoleBridgeEventRequest_1_a_2"));
        assert_eq!(name.starts_with('/'), cfg!(unix));
    }
}
