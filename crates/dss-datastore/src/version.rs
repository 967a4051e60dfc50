//! Backend family and version detection.
//!
//! CockroachDB and YugabyteDB both speak the Postgres wire protocol but
//! differ in SQL dialect and session settings, so every live connection is
//! classified from the string returned by `SELECT version()`.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use semver::Version;

use crate::error::{Error, Result};

static COCKROACH_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^CockroachDB (?:CCL|OSS) v(\d+)\.(\d+)\.(\d+)").expect("valid regex")
});

static YUGABYTE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PostgreSQL [\d.]+-YB-(\d+)\.(\d+)\.(\d+)").expect("valid regex")
});

/// First CockroachDB release where multi-statement batches run in an
/// implicit transaction unless the session opts out.
const IMPLICIT_BATCH_TXN_SINCE: Version = Version::new(22, 2, 0);

/// Supported SQL engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendFamily {
    /// CockroachDB.
    Cockroach,
    /// YugabyteDB (YSQL).
    Yugabyte,
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendFamily::Cockroach => write!(f, "cockroachdb"),
            BackendFamily::Yugabyte => write!(f, "yugabyte"),
        }
    }
}

/// Backend family and server version of a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendVersion {
    /// Server version.
    pub version: Version,
    /// Engine family.
    pub family: BackendFamily,
}

impl BackendVersion {
    /// Classify a raw `SELECT version()` string.
    pub fn detect(raw: &str) -> Result<Self> {
        let candidates = [
            (BackendFamily::Cockroach, &*COCKROACH_PATTERN),
            (BackendFamily::Yugabyte, &*YUGABYTE_PATTERN),
        ];

        for (family, pattern) in candidates {
            if let Some(caps) = pattern.captures(raw.trim()) {
                let part = |i: usize| caps[i].parse::<u64>();
                let (Ok(major), Ok(minor), Ok(patch)) = (part(1), part(2), part(3)) else {
                    return Err(Error::UnrecognizedBackend(raw.to_string()));
                };
                return Ok(Self {
                    version: Version::new(major, minor, patch),
                    family,
                });
            }
        }

        Err(Error::UnrecognizedBackend(raw.to_string()))
    }

    /// Whether this is a CockroachDB server.
    pub fn is_cockroach(&self) -> bool {
        self.family == BackendFamily::Cockroach
    }

    /// Whether this is a YugabyteDB server.
    pub fn is_yugabyte(&self) -> bool {
        self.family == BackendFamily::Yugabyte
    }

    /// Session statements that must precede every migration script.
    ///
    /// CockroachDB 22.2+ wraps multi-statement batches in one implicit
    /// transaction, which breaks scripts that mix DDL and DML, so the
    /// behavior is switched off for the session.
    pub fn migration_session_directives(&self) -> Vec<&'static str> {
        if self.is_cockroach() && self.version >= IMPLICIT_BATCH_TXN_SINCE {
            vec!["SET enable_implicit_transaction_for_batch_statements = false;"]
        } else {
            Vec::new()
        }
    }
}

impl fmt::Display for BackendVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.family, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_cockroach() {
        let raw = "CockroachDB CCL v24.1.3 (x86_64-pc-linux-gnu, built 2024/07/15 17:45:50, go1.22.5 X:nocoverageredesign)";
        let backend = BackendVersion::detect(raw).unwrap();
        assert_eq!(backend.family, BackendFamily::Cockroach);
        assert_eq!(backend.version, Version::new(24, 1, 3));
        assert!(backend.is_cockroach());
    }

    #[test]
    fn test_detect_cockroach_oss() {
        let backend = BackendVersion::detect("CockroachDB OSS v21.2.7 (x86_64-apple-darwin19)").unwrap();
        assert_eq!(backend.version, Version::new(21, 2, 7));
    }

    #[test]
    fn test_detect_yugabyte() {
        let raw = "PostgreSQL 11.2-YB-2.18.1.0-b0 on x86_64-pc-linux-gnu, compiled by clang version 15.0.3";
        let backend = BackendVersion::detect(raw).unwrap();
        assert_eq!(backend.family, BackendFamily::Yugabyte);
        assert_eq!(backend.version, Version::new(2, 18, 1));
        assert!(backend.is_yugabyte());
    }

    #[test]
    fn test_detect_unrecognized() {
        let err = BackendVersion::detect("PostgreSQL 15.3 on x86_64-pc-linux-gnu").unwrap_err();
        assert!(matches!(err, Error::UnrecognizedBackend(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_implicit_batch_directive() {
        let old = BackendVersion::detect("CockroachDB CCL v21.2.7 (linux)").unwrap();
        assert!(old.migration_session_directives().is_empty());

        let boundary = BackendVersion::detect("CockroachDB CCL v22.2.0 (linux)").unwrap();
        assert_eq!(boundary.migration_session_directives().len(), 1);

        let yugabyte = BackendVersion::detect("PostgreSQL 11.2-YB-2.20.0.0-b0 on linux").unwrap();
        assert!(yugabyte.migration_session_directives().is_empty());
    }
}
