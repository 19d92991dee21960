//! Host-to-sandbox path bindings.
//!
//! A backend exposes three kinds of bindings: the mandatory working-dir and
//! program mounts, extra mounts fixed at configuration time, and files
//! registered one by one with `add_file`. Registered files land under a
//! single directory keyed by base name, so base names must be unique across
//! the whole table.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistrationError;

/// Directory inside the sandbox that registered files are mapped under.
pub const FILE_MOUNT_DIR: &str = "/tmp";

/// One host-to-sandbox path binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// Host path.
    pub host_path: PathBuf,
    /// Path inside the sandbox.
    pub container_path: PathBuf,
    /// Whether the sandbox sees the path read-only.
    pub read_only: bool,
}

impl MountEntry {
    /// Creates a read-write binding.
    pub fn new(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host.into(),
            container_path: container.into(),
            read_only: false,
        }
    }

    /// Creates a read-only binding.
    pub fn read_only(host: impl Into<PathBuf>, container: impl Into<PathBuf>) -> Self {
        Self {
            read_only: true,
            ..Self::new(host, container)
        }
    }

    /// Returns the `host:container[:ro]` bind string for the engine.
    pub fn to_bind(&self) -> String {
        let ro = if self.read_only { ":ro" } else { "" };
        format!(
            "{}:{}{}",
            self.host_path.display(),
            self.container_path.display(),
            ro
        )
    }
}

/// Registered files and extra mounts for one backend instance.
///
/// Extra mounts are validated (absolute, outside the working directory,
/// pairwise distinct) before the table is built; the table only has to
/// defend the base-name namespace of registered files.
#[derive(Debug, Default)]
pub struct MountTable {
    /// Files registered via [`add_file`](Self::add_file), keyed by host path.
    registered: BTreeMap<PathBuf, MountEntry>,
    /// Base names claimed by registered files and the program binding.
    used_names: HashSet<String>,
    /// Extra mounts fixed at configuration time.
    extra: Vec<MountEntry>,
}

impl MountTable {
    pub(crate) fn new(extra: Vec<MountEntry>) -> Self {
        Self {
            registered: BTreeMap::new(),
            used_names: HashSet::new(),
            extra,
        }
    }

    /// Claims a base name without creating a binding.
    ///
    /// Used for the program binding, which is always present and must never
    /// be shadowed by a registered file of the same name.
    pub(crate) fn reserve_name(&mut self, name: &str) {
        self.used_names.insert(name.to_string());
    }

    /// Registers `host_path` to be mounted at `/tmp/<basename>`.
    ///
    /// Fails on relative or missing paths and on base-name collisions; a
    /// failed registration leaves the table untouched.
    pub fn add_file(
        &mut self,
        host_path: &Path,
        read_only: bool,
    ) -> Result<PathBuf, RegistrationError> {
        if !host_path.is_absolute() {
            return Err(RegistrationError::RelativePath(host_path.to_path_buf()));
        }
        let name = host_path
            .file_name()
            .ok_or_else(|| RegistrationError::NoFileName(host_path.to_path_buf()))?
            .to_string_lossy()
            .into_owned();
        if !host_path.exists() {
            return Err(RegistrationError::FileNotFound(host_path.to_path_buf()));
        }
        if self.used_names.contains(&name) {
            return Err(RegistrationError::DuplicateFileName(name));
        }

        let container_path = Path::new(FILE_MOUNT_DIR).join(&name);
        if self
            .extra
            .iter()
            .any(|mount| mount.container_path == container_path)
        {
            return Err(RegistrationError::TargetInUse(container_path));
        }

        debug!(
            host = %host_path.display(),
            container = %container_path.display(),
            "adding file mapping"
        );
        self.used_names.insert(name);
        self.registered.insert(
            host_path.to_path_buf(),
            MountEntry {
                host_path: host_path.to_path_buf(),
                container_path: container_path.clone(),
                read_only,
            },
        );
        Ok(container_path)
    }

    /// Sandbox path a registered file is mounted at.
    pub fn file_path_in_sandbox(&self, host_path: &Path) -> Result<PathBuf, RegistrationError> {
        self.registered
            .get(host_path)
            .map(|mount| mount.container_path.clone())
            .ok_or_else(|| RegistrationError::NotRegistered(host_path.to_path_buf()))
    }

    /// Full bind list for one run.
    ///
    /// The mandatory working-dir and program bindings come last so nothing
    /// earlier in the list can shadow them.
    pub(crate) fn bindings(&self, work: &MountEntry, program: &MountEntry) -> Vec<String> {
        self.registered
            .values()
            .chain(self.extra.iter())
            .chain([work, program])
            .map(MountEntry::to_bind)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"x").expect("write file");
        path
    }

    #[test]
    fn test_mount_entry_bind_strings() {
        let rw = MountEntry::new("/host/path", "/container/path");
        assert_eq!(rw.to_bind(), "/host/path:/container/path");

        let ro = MountEntry::read_only("/host/ro", "/container/ro");
        assert_eq!(ro.to_bind(), "/host/ro:/container/ro:ro");
    }

    #[test]
    fn test_registered_file_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ktest = touch(&dir, "ktest");

        let mut table = MountTable::default();
        let sandbox_path = table.add_file(&ktest, true).expect("register");
        assert_eq!(sandbox_path, Path::new("/tmp/ktest"));
        assert_eq!(
            table.file_path_in_sandbox(&ktest).expect("lookup"),
            sandbox_path
        );
    }

    #[test]
    fn test_unregistered_path_fails_lookup() {
        let table = MountTable::default();
        assert!(matches!(
            table.file_path_in_sandbox(Path::new("/abs/ktest")),
            Err(RegistrationError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_duplicate_base_name_is_rejected_without_mutation() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = touch(&dir, "ktest");
        let other_dir = tempfile::tempdir().expect("tempdir");
        let second = touch(&other_dir, "ktest");

        let mut table = MountTable::default();
        table.add_file(&first, true).expect("first registration");

        assert!(matches!(
            table.add_file(&second, true),
            Err(RegistrationError::DuplicateFileName(name)) if name == "ktest"
        ));
        // The original registration is still intact.
        assert!(table.file_path_in_sandbox(&first).is_ok());
        assert!(table.file_path_in_sandbox(&second).is_err());
    }

    #[test]
    fn test_relative_and_missing_paths_are_rejected() {
        let mut table = MountTable::default();
        assert!(matches!(
            table.add_file(Path::new("relative/ktest"), true),
            Err(RegistrationError::RelativePath(_))
        ));
        assert!(matches!(
            table.add_file(Path::new("/no/such/file/anywhere"), true),
            Err(RegistrationError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_reserved_program_name_collides() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prog = touch(&dir, "prog.bc");

        let mut table = MountTable::default();
        table.reserve_name("prog.bc");
        assert!(matches!(
            table.add_file(&prog, true),
            Err(RegistrationError::DuplicateFileName(_))
        ));
    }

    #[test]
    fn test_extra_mount_target_collision_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let seed = touch(&dir, "seed");

        let mut table = MountTable::new(vec![MountEntry::read_only("/data/seed", "/tmp/seed")]);
        assert!(matches!(
            table.add_file(&seed, true),
            Err(RegistrationError::TargetInUse(_))
        ));
    }

    #[test]
    fn test_mandatory_bindings_come_last() {
        let dir = tempfile::tempdir().expect("tempdir");
        let extra_file = touch(&dir, "input");

        let mut table = MountTable::new(vec![MountEntry::read_only("/data", "/corpus")]);
        table.add_file(&extra_file, false).expect("register");

        let work = MountEntry::new("/host/work", "/mnt/");
        let program = MountEntry::read_only("/host/prog", "/tmp/prog");
        let binds = table.bindings(&work, &program);

        assert_eq!(binds.len(), 4);
        assert_eq!(binds[binds.len() - 2], "/host/work:/mnt/");
        assert_eq!(binds[binds.len() - 1], "/host/prog:/tmp/prog:ro");
    }
}
