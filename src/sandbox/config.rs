//! Backend configuration and its validation pass.
//!
//! The configuration is a plain struct with named fields and builder
//! methods; a single `validate()` pass checks every field and produces a
//! typed [`ConfigError`]. Anything that passes validation is semantically
//! usable for the lifetime of the backend instance.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::OnceLock;

use nix::unistd::{Gid, Uid};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::limits::ResourceLimits;
use crate::sandbox::mounts::MountEntry;

/// Default working directory inside the sandbox.
pub const DEFAULT_IMAGE_WORK_DIR: &str = "/mnt/";

/// Identity to run as inside the sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserSpec {
    /// Map to the calling process's `uid:gid` (the default).
    #[default]
    HostUser,
    /// A numeric uid.
    Uid(u32),
    /// A named user known to the image.
    Name(String),
    /// Leave the image's default user in place.
    Inherit,
}

impl UserSpec {
    /// Resolves to the string handed to the engine; `None` for
    /// [`UserSpec::Inherit`].
    pub(crate) fn resolve(&self) -> Result<Option<String>, ConfigError> {
        match self {
            UserSpec::HostUser => Ok(Some(format!("{}:{}", Uid::current(), Gid::current()))),
            UserSpec::Uid(uid) => Ok(Some(uid.to_string())),
            UserSpec::Name(name) => {
                if username_pattern().is_match(name) {
                    Ok(Some(name.clone()))
                } else {
                    Err(ConfigError::InvalidUser(name.clone()))
                }
            }
            UserSpec::Inherit => Ok(None),
        }
    }
}

fn username_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z_][a-z0-9_-]*\$?$").expect("username pattern is valid")
    })
}

/// Immutable execution policy for one backend instance.
///
/// One of these fully determines how every run on the backend is isolated:
/// which image, which paths the sandbox sees, as whom the program runs, and
/// under which resource limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Docker image tag, matched exactly against the local image catalog.
    pub image: String,
    /// Host path of the program to execute, mounted read-only.
    pub program_path: PathBuf,
    /// Host working directory, mounted read-write at `image_work_dir`.
    pub working_dir: PathBuf,
    /// Resource limits applied to every run.
    pub limits: ResourceLimits,
    /// Working directory inside the sandbox.
    pub image_work_dir: PathBuf,
    /// Identity to run as inside the sandbox.
    pub user: UserSpec,
    /// Disables the tool-existence probe.
    pub skip_tool_check: bool,
    /// Host path of the exit-stats shim binary; enables CPU accounting.
    pub stats_shim: Option<PathBuf>,
    /// Additional bind mounts, validated against the working directory.
    pub extra_mounts: Vec<MountEntry>,
}

impl BackendConfig {
    /// Creates a configuration with default isolation settings.
    pub fn new(
        image: impl Into<String>,
        program_path: impl Into<PathBuf>,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            image: image.into(),
            program_path: program_path.into(),
            working_dir: working_dir.into(),
            limits: ResourceLimits::default(),
            image_work_dir: PathBuf::from(DEFAULT_IMAGE_WORK_DIR),
            user: UserSpec::default(),
            skip_tool_check: false,
            stats_shim: None,
            extra_mounts: Vec::new(),
        }
    }

    /// Sets the resource limits.
    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Overrides the working directory inside the sandbox.
    pub fn with_image_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.image_work_dir = dir.into();
        self
    }

    /// Sets the identity to run as inside the sandbox.
    pub fn with_user(mut self, user: UserSpec) -> Self {
        self.user = user;
        self
    }

    /// Disables the tool-existence probe.
    pub fn skip_tool_check(mut self) -> Self {
        self.skip_tool_check = true;
        self
    }

    /// Enables the exit-stats shim at the given host path.
    pub fn with_stats_shim(mut self, shim: impl Into<PathBuf>) -> Self {
        self.stats_shim = Some(shim.into());
        self
    }

    /// Adds an extra bind mount.
    pub fn with_extra_mount(mut self, mount: MountEntry) -> Self {
        self.extra_mounts.push(mount);
        self
    }

    /// Validates every field and resolves the user spec.
    ///
    /// This is the construction-time pass: any error here is fatal to the
    /// backend instance being built and never retried.
    pub(crate) fn validate(&self) -> Result<Option<String>, ConfigError> {
        if self.image.is_empty() {
            return Err(ConfigError::EmptyImage);
        }

        for (option, path) in [
            ("program_path", &self.program_path),
            ("working_dir", &self.working_dir),
            ("image_work_dir", &self.image_work_dir),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::RelativePath {
                    option,
                    path: path.clone(),
                });
            }
        }
        if self.program_path.file_name().is_none() {
            return Err(ConfigError::InvalidProgramPath(self.program_path.clone()));
        }

        let user = self.user.resolve()?;

        if let Some(shim) = &self.stats_shim {
            if !shim.exists() {
                return Err(ConfigError::ShimNotFound(shim.clone()));
            }
        }

        let mut targets = HashSet::new();
        for mount in &self.extra_mounts {
            if !mount.host_path.is_absolute() {
                return Err(ConfigError::MountHostPathNotAbsolute(
                    mount.host_path.clone(),
                ));
            }
            if !mount.container_path.is_absolute() {
                return Err(ConfigError::MountTargetNotAbsolute(
                    mount.container_path.clone(),
                ));
            }
            if mount.container_path.starts_with(&self.image_work_dir) {
                return Err(ConfigError::MountInsideWorkDir {
                    target: mount.container_path.clone(),
                    work_dir: self.image_work_dir.clone(),
                });
            }
            if !targets.insert(mount.container_path.clone()) {
                return Err(ConfigError::DuplicateMountTarget(
                    mount.container_path.clone(),
                ));
            }
        }

        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> BackendConfig {
        BackendConfig::new("alpine:latest", "/bin/prog", "/work")
    }

    #[test]
    fn test_defaults() {
        let config = valid_config();
        assert_eq!(config.image_work_dir, PathBuf::from("/mnt/"));
        assert_eq!(config.user, UserSpec::HostUser);
        assert!(!config.skip_tool_check);
        assert!(config.stats_shim.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_image_is_rejected() {
        let config = BackendConfig::new("", "/bin/prog", "/work");
        assert!(matches!(config.validate(), Err(ConfigError::EmptyImage)));
    }

    #[test]
    fn test_relative_paths_are_rejected() {
        let config = BackendConfig::new("alpine:latest", "bin/prog", "/work");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath { option: "program_path", .. })
        ));

        let config = valid_config().with_image_work_dir("mnt");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RelativePath { option: "image_work_dir", .. })
        ));
    }

    #[test]
    fn test_host_user_resolves_to_uid_gid() {
        let user = UserSpec::HostUser.resolve().expect("resolve").expect("some");
        let (uid, gid) = user.split_once(':').expect("uid:gid");
        assert!(uid.parse::<u32>().is_ok());
        assert!(gid.parse::<u32>().is_ok());
    }

    #[test]
    fn test_usernames_are_validated() {
        assert!(UserSpec::Name("klee".to_string()).resolve().is_ok());
        assert!(UserSpec::Name("_daemon-1$".to_string()).resolve().is_ok());
        assert!(matches!(
            UserSpec::Name("Not A User".to_string()).resolve(),
            Err(ConfigError::InvalidUser(_))
        ));
        assert!(matches!(
            UserSpec::Name("0root".to_string()).resolve(),
            Err(ConfigError::InvalidUser(_))
        ));
    }

    #[test]
    fn test_inherit_resolves_to_none() {
        assert_eq!(UserSpec::Inherit.resolve().expect("resolve"), None);
    }

    #[test]
    fn test_missing_shim_binary_fails_validation() {
        let config = valid_config().with_stats_shim("/no/such/shim");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ShimNotFound(_))
        ));
    }

    #[test]
    fn test_mount_nested_under_work_dir_is_rejected() {
        let config = valid_config()
            .with_extra_mount(MountEntry::read_only("/data", "/mnt/data"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MountInsideWorkDir { .. })
        ));
    }

    #[test]
    fn test_mount_equal_to_work_dir_is_rejected() {
        let config = valid_config().with_extra_mount(MountEntry::read_only("/data", "/mnt"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MountInsideWorkDir { .. })
        ));
    }

    #[test]
    fn test_sibling_of_work_dir_is_allowed() {
        // Component-wise comparison: /mnt2 is not under /mnt/.
        let config = valid_config().with_extra_mount(MountEntry::read_only("/data", "/mnt2"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_relative_mount_paths_are_rejected() {
        let config = valid_config().with_extra_mount(MountEntry::read_only("data", "/corpus"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MountHostPathNotAbsolute(_))
        ));

        let config = valid_config().with_extra_mount(MountEntry::read_only("/data", "corpus"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MountTargetNotAbsolute(_))
        ));
    }

    #[test]
    fn test_duplicate_mount_targets_are_rejected() {
        let config = valid_config()
            .with_extra_mount(MountEntry::read_only("/data-a", "/corpus"))
            .with_extra_mount(MountEntry::read_only("/data-b", "/corpus"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateMountTarget(_))
        ));
    }
}
