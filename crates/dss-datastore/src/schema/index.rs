//! Migration step discovery.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;
use tracing::debug;

use super::Direction;
use crate::error::{Error, Result};

static STEP_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(upto|downfrom)-v(\d+)\.(\d+)\.(\d+)-(.+)\.sql$").expect("valid regex")
});

/// Version of an empty database, before any `upto` file has run.
pub const ORIGIN_VERSION: Version = Version::new(0, 0, 0);

/// One schema version and the files that enter and leave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationStep {
    /// Version this step produces.
    pub version: Version,
    /// Moves the database from the previous step to this one.
    pub up_file: Option<PathBuf>,
    /// Moves the database from this step back to the previous one.
    pub down_file: Option<PathBuf>,
}

impl MigrationStep {
    fn new(version: Version) -> Self {
        Self {
            version,
            up_file: None,
            down_file: None,
        }
    }

    /// The synthetic step for an empty database.
    pub fn origin() -> Self {
        Self::new(ORIGIN_VERSION)
    }
}

/// Scan `directory` (non-recursively) for migration files.
///
/// Returns the steps in ascending version order, starting with the
/// synthetic 0.0.0 origin. Files that do not follow the naming convention
/// are ignored. Gaps between versions are not detected.
pub fn enumerate_steps(directory: &Path) -> Result<Vec<MigrationStep>> {
    let unreadable = |source| Error::DirectoryUnreadable {
        path: directory.to_path_buf(),
        source,
    };

    let mut by_version: BTreeMap<Version, MigrationStep> = BTreeMap::new();

    for entry in std::fs::read_dir(directory).map_err(unreadable)? {
        let entry = entry.map_err(unreadable)?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        let Some(caps) = STEP_FILE_PATTERN.captures(name) else {
            debug!(file = name, "ignoring non-migration file");
            continue;
        };

        let part = |i: usize| caps[i].parse::<u64>();
        let (Ok(major), Ok(minor), Ok(patch)) = (part(2), part(3), part(4)) else {
            debug!(file = name, "ignoring migration file with out-of-range version");
            continue;
        };
        let version = Version::new(major, minor, patch);
        if version == ORIGIN_VERSION {
            debug!(file = name, "ignoring migration file for the origin version");
            continue;
        }

        let step = by_version
            .entry(version.clone())
            .or_insert_with(|| MigrationStep::new(version));
        let (slot, direction) = match &caps[1] {
            "upto" => (&mut step.up_file, Direction::Up),
            "downfrom" => (&mut step.down_file, Direction::Down),
            other => {
                return Err(Error::MalformedStepPrefix {
                    file: name.to_string(),
                    prefix: other.to_string(),
                })
            }
        };
        if let Some(existing) = slot.as_deref() {
            let mut names = [file_label(existing), name.to_string()];
            names.sort();
            let [first, second] = names;
            return Err(Error::DuplicateStepFile {
                version: step.version.clone(),
                direction,
                first,
                second,
            });
        }
        *slot = Some(entry.path());
    }

    if by_version.is_empty() {
        return Err(Error::NoMigrationsFound {
            path: directory.to_path_buf(),
        });
    }

    let mut steps = Vec::with_capacity(by_version.len() + 1);
    steps.push(MigrationStep::origin());
    steps.extend(by_version.into_values());
    Ok(steps)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "-- migration\n").unwrap();
    }

    #[test]
    fn test_enumerate_orders_by_semver() {
        let dir = tempfile::tempdir().unwrap();
        // Lexical order would put 10.0.0 before 2.0.0.
        touch(dir.path(), "upto-v10.0.0-late.sql");
        touch(dir.path(), "upto-v2.0.0-addcol.sql");
        touch(dir.path(), "upto-v1.0.0-init.sql");
        touch(dir.path(), "upto-v2.1.0-index.sql");

        let steps = enumerate_steps(dir.path()).unwrap();
        let versions: Vec<_> = steps.iter().map(|s| s.version.to_string()).collect();
        assert_eq!(versions, ["0.0.0", "1.0.0", "2.0.0", "2.1.0", "10.0.0"]);
    }

    #[test]
    fn test_enumerate_pairs_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "upto-v1.0.0-init.sql");
        touch(dir.path(), "downfrom-v1.0.0-init.sql");
        touch(dir.path(), "upto-v2.0.0-addcol.sql");

        let steps = enumerate_steps(dir.path()).unwrap();
        assert_eq!(steps.len(), 3);

        assert_eq!(steps[0], MigrationStep::origin());
        assert!(steps[1].up_file.is_some());
        assert!(steps[1].down_file.is_some());
        assert!(steps[2].up_file.is_some());
        assert!(steps[2].down_file.is_none());
        assert_eq!(
            steps[2].up_file.as_ref().unwrap().file_name().unwrap(),
            "upto-v2.0.0-addcol.sql"
        );
    }

    #[test]
    fn test_enumerate_ignores_other_files() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "README.md");
        touch(dir.path(), "upto-v1.0.0.sql");
        touch(dir.path(), "sideways-v1.0.0-init.sql");
        touch(dir.path(), "upto-v1.0.0-init.sql.bak");
        touch(dir.path(), "upto-v1.0.0-init.sql");
        fs::create_dir(dir.path().join("yugabyte")).unwrap();

        let steps = enumerate_steps(dir.path()).unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].version, Version::new(1, 0, 0));
    }

    #[test]
    fn test_enumerate_rejects_duplicate_direction() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "upto-v1.0.0-alpha.sql");
        touch(dir.path(), "upto-v1.0.0-beta.sql");
        touch(dir.path(), "downfrom-v1.0.0-alpha.sql");

        match enumerate_steps(dir.path()).unwrap_err() {
            Error::DuplicateStepFile {
                version,
                direction,
                first,
                second,
            } => {
                assert_eq!(version, Version::new(1, 0, 0));
                assert_eq!(direction, Direction::Up);
                assert_eq!(first, "upto-v1.0.0-alpha.sql");
                assert_eq!(second, "upto-v1.0.0-beta.sql");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_enumerate_allows_one_file_per_direction() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "upto-v1.0.0-init.sql");
        touch(dir.path(), "downfrom-v1.0.0-teardown.sql");

        let steps = enumerate_steps(dir.path()).unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn test_enumerate_empty_directory() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "README.md");

        let err = enumerate_steps(dir.path()).unwrap_err();
        assert!(matches!(err, Error::NoMigrationsFound { .. }));
    }

    #[test]
    fn test_enumerate_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = enumerate_steps(&dir.path().join("nope")).unwrap_err();
        assert!(matches!(err, Error::DirectoryUnreadable { .. }));
    }

    #[test]
    fn test_enumerate_is_strictly_ascending_from_origin() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "upto-v3.1.0-a.sql",
            "downfrom-v3.1.0-a.sql",
            "upto-v1.0.0-b.sql",
            "upto-v3.0.0-c.sql",
            "downfrom-v1.0.1-d.sql",
        ] {
            touch(dir.path(), name);
        }

        let steps = enumerate_steps(dir.path()).unwrap();
        assert_eq!(steps[0].version, ORIGIN_VERSION);
        assert!(steps.windows(2).all(|w| w[0].version < w[1].version));
    }
}
