//! Schema lifecycle: discovering migration steps and walking a live
//! database between schema versions.
//!
//! Migration files live in one directory per logical database and follow
//! the naming convention `(upto|downfrom)-v<major>.<minor>.<patch>-<label>.sql`.
//! An `upto` file moves a database from the previous version to the named
//! version; a `downfrom` file moves it from the named version back to the
//! previous one.
//!
//! # Example
//!
//! ```ignore
//! use dss_datastore::schema::{enumerate_steps, migrate, MigrationSession};
//!
//! let steps = enumerate_steps(&schemas_dir)?;
//! let mut session = MigrationSession::open(&params).await?;
//! let outcome = migrate(&current, &target, &steps, "rid", &mut session).await?;
//! println!("now at {} in {}", outcome.version, outcome.database);
//! ```

pub mod executor;
pub mod index;
pub mod session;

use std::fmt;

pub use executor::{migrate, MigrationOutcome, SqlRunner};
pub use index::{enumerate_steps, MigrationStep};
pub use session::MigrationSession;

/// Direction of travel through the step sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Toward newer versions, running `upto` files.
    Up,
    /// Toward older versions, running `downfrom` files.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "up"),
            Direction::Down => write!(f, "down"),
        }
    }
}
