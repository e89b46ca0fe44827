//! Privilege check for registry-mutating operations (spec.md §4.B
//! "Access control", §6 "Persistence: Write access requires
//! administrative privilege").

/// Abstracts "is the calling process allowed to write the registry" so
/// tests can force both outcomes without actually dropping privileges.
pub trait PrivilegeChecker: Send + Sync {
    fn has_write_access(&self) -> bool;
}

/// Checks the real OS privilege: root on Unix. usbipd-win's equivalent
/// is "running elevated"; this is the Unix analogue for the same
/// requirement ("write access requires administrative privilege",
/// spec.md §6).
pub struct ProcessPrivilegeChecker;

impl PrivilegeChecker for ProcessPrivilegeChecker {
    fn has_write_access(&self) -> bool {
        nix::unistd::Uid::effective().is_root()
    }
}

/// Fixed-answer checker for tests.
pub struct AlwaysAllow;
impl PrivilegeChecker for AlwaysAllow {
    fn has_write_access(&self) -> bool {
        true
    }
}

pub struct AlwaysDeny;
impl PrivilegeChecker for AlwaysDeny {
    fn has_write_access(&self) -> bool {
        false
    }
}
