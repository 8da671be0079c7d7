//! The version engine.
//!
//! A repository is a sequence of numbered versions. Which content a version
//! holds is never stored directly; it is derived from the content ledger,
//! where each row records the version that added a unit and the version
//! that removed it again.
//!
//! - [`ledger`]: the rows and the derived content sets
//! - [`VersionReader`]: queries over complete versions
//! - [`VersionBuilder`]: creating versions, one guarded build at a time
//! - [`VersionDeleter`]: deleting versions without changing any other

mod builder;
mod error;
pub mod ledger;
mod reader;
mod squash;

pub use builder::{VersionBuilder, VersionGuard};
pub use error::{VersionError, VersionResult};
pub use ledger::{add_entries, close_entries, Ledger};
pub use reader::{VersionInfo, VersionReader};
pub use squash::{Deletion, VersionDeleter};
