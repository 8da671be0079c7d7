//! Tables as Git trees.
//!
//! The root tree of every commit holds one directory per table plus the
//! `_meta` directory. A table directory holds one `{key}.json` blob per
//! record.

use std::collections::HashMap;

use git2::{FileMode, ObjectType, Repository, Tree, TreeBuilder};

use crate::storage::blob::BlobId;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::types::{RecordKey, TableName, TreeId};

/// directory holding store metadata
pub(crate) const META_DIR: &str = "_meta";

/// on-disk format marker written into `_meta/format.json`
pub(crate) const FORMAT_MARKER: &[u8] = br#"{"format":"contentdb","version":1}"#;

const RECORD_SUFFIX: &str = ".json";

fn record_file(key: &RecordKey) -> String {
    format!("{}{}", key, RECORD_SUFFIX)
}

/// The root tree of one commit. Read-only.
#[derive(Debug)]
pub struct TreeHandle<'repo> {
    tree: Tree<'repo>,
}

impl<'repo> TreeHandle<'repo> {
    pub(crate) fn new(tree: Tree<'repo>) -> Self {
        Self { tree }
    }

    /// Table directories; `_`-prefixed entries are internal and skipped.
    pub fn list_tables(&self) -> Vec<TableName> {
        self.tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Tree))
            .filter_map(|entry| entry.name().map(str::to_string))
            .filter(|name| !name.starts_with('_'))
            .filter_map(|name| TableName::new(name).ok())
            .collect()
    }

    pub fn table_exists(&self, table: &TableName) -> bool {
        self.tree
            .get_name(table.as_str())
            .is_some_and(|entry| entry.kind() == Some(ObjectType::Tree))
    }

    fn table_tree(&self, repo: &'repo Repository, table: &TableName) -> StorageResult<Option<Tree<'repo>>> {
        let Some(entry) = self.tree.get_name(table.as_str()) else {
            return Ok(None);
        };
        if entry.kind() != Some(ObjectType::Tree) {
            return Err(StorageError::UnexpectedEntryType {
                path: table.as_str().into(),
                expected: "table directory".to_string(),
                found: format!("{:?}", entry.kind()),
            });
        }
        Ok(Some(repo.find_tree(entry.id())?))
    }

    /// Every record of a table with the blob holding it.
    pub fn list_record_blobs(&self, repo: &'repo Repository, table: &TableName) -> StorageResult<Vec<(RecordKey, BlobId)>> {
        let tree = self
            .table_tree(repo, table)?
            .ok_or_else(|| StorageError::TableNotFound(table.clone()))?;

        let records = tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Blob))
            .filter_map(|entry| {
                let key = RecordKey::new(entry.name()?.strip_suffix(RECORD_SUFFIX)?).ok()?;
                Some((key, BlobId::new(entry.id())))
            })
            .collect();
        Ok(records)
    }

    pub fn list_records(&self, repo: &'repo Repository, table: &TableName) -> StorageResult<Vec<RecordKey>> {
        Ok(self
            .list_record_blobs(repo, table)?
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    /// Blob of one record; `None` when the record or its whole table is missing.
    pub fn get_record_blob_id(
        &self,
        repo: &'repo Repository,
        table: &TableName,
        key: &RecordKey,
    ) -> StorageResult<Option<BlobId>> {
        let Some(tree) = self.table_tree(repo, table)? else {
            return Ok(None);
        };

        let found = match tree.get_name(&record_file(key)) {
            Some(entry) if entry.kind() == Some(ObjectType::Blob) => Ok(Some(BlobId::new(entry.id()))),
            Some(entry) => Err(StorageError::UnexpectedEntryType {
                path: format!("{}/{}", table, record_file(key)).into(),
                expected: "record blob".to_string(),
                found: format!("{:?}", entry.kind()),
            }),
            None => Ok(None),
        };
        found
    }

    /// Start a new tree based on this one.
    pub fn mutate(&self, repo: &'repo Repository) -> StorageResult<TreeMutator<'repo>> {
        let tables = self
            .tree
            .iter()
            .filter(|entry| entry.kind() == Some(ObjectType::Tree))
            .filter_map(|entry| Some((entry.name()?.to_string(), entry.id())))
            .collect();

        Ok(TreeMutator {
            repo,
            root: repo.treebuilder(Some(&self.tree))?,
            touched: HashMap::new(),
            tables,
        })
    }
}

/// Accumulates table and record changes, then writes them as a new root tree.
///
/// Table subtrees are only rebuilt when something inside them changes.
pub struct TreeMutator<'repo> {
    repo: &'repo Repository,
    root: TreeBuilder<'repo>,
    /// builders for tables changed so far
    touched: HashMap<String, TreeBuilder<'repo>>,
    /// subtree of every table present in the tree being built
    tables: HashMap<String, git2::Oid>,
}

impl<'repo> TreeMutator<'repo> {
    pub fn contains_table(&self, table: &TableName) -> bool {
        self.tables.contains_key(table.as_str())
    }

    fn table_builder(&mut self, table: &TableName) -> StorageResult<&mut TreeBuilder<'repo>> {
        let Some(&base) = self.tables.get(table.as_str()) else {
            return Err(StorageError::TableNotFound(table.clone()));
        };

        if !self.touched.contains_key(table.as_str()) {
            let base = self.repo.find_tree(base)?;
            let builder = self.repo.treebuilder(Some(&base))?;
            self.touched.insert(table.as_str().to_string(), builder);
        }
        self.touched
            .get_mut(table.as_str())
            .ok_or_else(|| StorageError::Internal(format!("no tree builder for {}", table)))
    }

    /// Add an empty table directory.
    pub fn create_table(&mut self, table: &TableName) -> StorageResult<()> {
        if self.contains_table(table) {
            return Err(StorageError::TableAlreadyExists(table.clone()));
        }

        let empty = self.repo.treebuilder(None)?.write()?;
        self.root.insert(table.as_str(), empty, FileMode::Tree.into())?;
        self.tables.insert(table.as_str().to_string(), empty);
        Ok(())
    }

    pub fn upsert_record(&mut self, table: &TableName, key: &RecordKey, blob_id: BlobId) -> StorageResult<()> {
        self.table_builder(table)?
            .insert(record_file(key), blob_id.raw(), FileMode::Blob.into())?;
        Ok(())
    }

    /// Remove a record; fails with `RecordNotFound` if it is not there.
    pub fn delete_record(&mut self, table: &TableName, key: &RecordKey) -> StorageResult<()> {
        self.table_builder(table)?
            .remove(record_file(key))
            .map_err(|_| StorageError::RecordNotFound {
                table: table.clone(),
                key: key.clone(),
            })
    }

    /// Write every touched table, then the root, and return the root's id.
    pub fn write(mut self) -> StorageResult<TreeId> {
        for (table, builder) in self.touched {
            let subtree = builder.write()?;
            self.root.insert(table.as_str(), subtree, FileMode::Tree.into())?;
        }
        Ok(TreeId::new(self.root.write()?))
    }
}

/// Root tree of a fresh store: only `_meta/format.json`.
pub fn create_initial_tree(repo: &Repository) -> StorageResult<TreeId> {
    let marker = repo.blob(FORMAT_MARKER)?;
    let mut meta = repo.treebuilder(None)?;
    meta.insert("format.json", marker, FileMode::Blob.into())?;
    let meta = meta.write()?;

    let mut root = repo.treebuilder(None)?;
    root.insert(META_DIR, meta, FileMode::Tree.into())?;
    Ok(TreeId::new(root.write()?))
}
