use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BUS_NAME: &str = "org.pop_os.transition_system";
pub const OBJECT_PATH: &str = "/org/pop_os/transition_system";
pub const INTERFACE_NAME: &str = "org.pop_os.transition_system.Interface";

/// Polkit action guarding every call on the interface.
pub const REMOVE_PRIVILEGE: &str = "org.pop_os.transition_system.removedebs";

/// Errors returned across the bus by the privileged service.
#[derive(zbus::DBusError, Debug)]
#[zbus(prefix = "org.pop_os.transition_system")]
pub enum TransitionError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// The policy authority refused the caller. Carries the denied privilege.
    PermissionDeniedByPolicy(String),
    /// The package system refused an operation (lock file, index refresh, dpkg).
    PackageSystem(String),
    /// A call arrived in a state that does not allow it, e.g. `OpenCache`
    /// without holding the lock.
    OutOfOrder(String),
    /// The policy authority could not be consulted.
    AuthorityFailed(String),
}

impl TransitionError {
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDeniedByPolicy(_))
    }
}

#[zbus::proxy(
    interface = "org.pop_os.transition_system.Interface",
    default_service = "org.pop_os.transition_system",
    default_path = "/org/pop_os/transition_system"
)]
pub trait TransitionSystem {
    fn obtain_lock(&self) -> Result<bool, TransitionError>;

    fn release_lock(&self) -> Result<bool, TransitionError>;

    fn open_cache(&self) -> Result<bool, TransitionError>;

    fn mark_package_for_removal(&self, name: &str) -> Result<String, TransitionError>;

    fn commit_changes(&self) -> Result<bool, TransitionError>;

    fn close_cache(&self) -> Result<bool, TransitionError>;

    fn remove_packages(&self, names: Vec<String>) -> Result<bool, TransitionError>;

    fn exit(&self) -> Result<(), TransitionError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("`{0}` is not a valid Debian package name")]
pub struct InvalidPackageName(pub String);

/// One Debian package selected for removal.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PackageRequest(String);

impl PackageRequest {
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidPackageName> {
        let name = name.into();
        if is_valid_package_name(&name) {
            Ok(Self(name))
        } else {
            Err(InvalidPackageName(name))
        }
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PackageRequest {
    type Error = InvalidPackageName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<PackageRequest> for String {
    fn from(value: PackageRequest) -> Self {
        value.0
    }
}

impl fmt::Display for PackageRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Debian policy §5.6.7: lowercase alphanumerics, `+`, `-` and `.`, at least
/// two characters, starting with an alphanumeric. An `:arch` qualifier is
/// accepted the way dpkg prints multi-arch packages.
pub fn is_valid_package_name(name: &str) -> bool {
    let (package, arch) = match name.split_once(':') {
        Some((package, arch)) => (package, Some(arch)),
        None => (name, None),
    };

    let mut chars = package.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !(first.is_ascii_lowercase() || first.is_ascii_digit()) || package.len() < 2 {
        return false;
    }
    if !chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "+-.".contains(c)) {
        return false;
    }

    match arch {
        None => true,
        Some(arch) => {
            !arch.is_empty()
                && arch
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        }
    }
}
