//! contentdb - versioned content repositories stored in Git
//!
//! A repository is an ever-growing sequence of numbered, immutable versions,
//! each one a set of content references. Which version holds which content
//! is tracked in a ledger of add/remove rows, so versions can be derived
//! from one another, built under transactional isolation, and deleted
//! without changing what any other version holds.
//!
//! Every write is a Git commit, every transaction a branch.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use contentdb::db::ContentStore;
//! use contentdb::model::{ContentSet, ContentType};
//!
//! let store = ContentStore::open("./my_store").unwrap();
//! store.create_repository("isos", None).unwrap();
//!
//! let iso = store
//!     .create_content(&ContentType::new("file.file").unwrap(), None, BTreeMap::new())
//!     .unwrap();
//! let add: ContentSet = std::iter::once(iso).collect();
//! let version = store.add_and_remove("isos", None, &add, &ContentSet::new()).unwrap();
//! assert_eq!(version.number, 1);
//! ```

pub mod db;
pub mod model;
pub mod orphan;
pub mod storage;
pub mod transaction;
pub mod version;
