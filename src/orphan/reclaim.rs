//! The orphan sweep.
//!
//! A content unit is an orphan when no repository holds an open ledger
//! entry for it. An artifact is an orphan when no surviving content unit
//! links to it. The sweep is not tied to any version operation: every step
//! re-checks its candidates inside its own transaction, so it can run next
//! to builds and can be re-run after a crash.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;

use crate::model::{
    Artifact, ArtifactId, ContentArtifact, ContentId, ContentRef, ContentType, ContentUnit, Model, RepositoryContent,
    Stored,
};
use crate::orphan::blob::BlobStorage;
use crate::orphan::progress::{ProgressReport, ProgressSink};
use crate::storage::WriteBatch;
use crate::transaction::{ReadView, Snapshot, TransactionError, TransactionManager, TransactionResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReclaimReport {
    pub content_removed: usize,
    pub artifacts_removed: usize,
    /// artifacts whose record is gone but whose bytes could not be deleted
    pub blob_failures: usize,
}

pub struct OrphanReclaimer {
    manager: TransactionManager,
    blobs: Arc<dyn BlobStorage>,
    progress: Arc<dyn ProgressSink>,
    max_attempts: u32,
}

impl OrphanReclaimer {
    pub fn new(manager: TransactionManager, blobs: Arc<dyn BlobStorage>, progress: Arc<dyn ProgressSink>) -> Self {
        Self {
            manager,
            blobs,
            progress,
            max_attempts: 3,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn reclaim(&self) -> TransactionResult<ReclaimReport> {
        let mut report = ReclaimReport::default();

        let snapshot = Snapshot::head(self.manager.store().clone())?;
        let active = active_content(&snapshot)?;
        let mut by_type: BTreeMap<ContentType, usize> = BTreeMap::new();
        for unit in ContentUnit::load_all(&snapshot)? {
            let content = ContentRef::new(unit.model.content_type.clone(), unit.id());
            if !active.contains(&content) {
                *by_type.entry(content.content_type).or_default() += 1;
            }
        }

        for (content_type, candidates) in by_type {
            let mut progress = ProgressReport::running(format!("Clean up orphan content of type: {}", content_type), candidates);
            self.progress.report(&progress);

            let removed = self.remove_orphan_content(&content_type)?;
            report.content_removed += removed;

            progress.complete();
            self.progress.report(&progress);
        }

        let artifacts = self.remove_orphan_artifacts()?;
        let mut progress = ProgressReport::running("Clean up orphan Artifacts", artifacts.len());
        self.progress.report(&progress);
        for artifact in &artifacts {
            if let Err(e) = self.blobs.delete_blob(&artifact.model) {
                tracing::warn!(artifact = %artifact.key(), location = %artifact.model.location, error = %e, "failed to delete blob");
                report.blob_failures += 1;
            }
            progress.increment();
            self.progress.report(&progress);
        }
        report.artifacts_removed = artifacts.len();

        progress.complete();
        self.progress.report(&progress);

        tracing::info!(
            content_removed = report.content_removed,
            artifacts_removed = report.artifacts_removed,
            blob_failures = report.blob_failures,
            "orphan cleanup finished"
        );
        Ok(report)
    }

    /// Delete orphaned units of one type along with their artifact links.
    fn remove_orphan_content(&self, content_type: &ContentType) -> TransactionResult<usize> {
        self.manager
            .with_retries(self.max_attempts, TransactionError::is_retryable, |tx| {
                let active = active_content(&*tx)?;
                let orphans: HashSet<ContentId> = ContentUnit::load_all(&*tx)?
                    .into_iter()
                    .filter(|unit| &unit.model.content_type == content_type)
                    .map(|unit| unit.id::<ContentId>())
                    .filter(|id| !active.contains(&ContentRef::new(content_type.clone(), id.clone())))
                    .collect();
                if orphans.is_empty() {
                    return Ok(0);
                }

                let mut batch = WriteBatch::new(format!("remove orphan {} content", content_type));
                for id in &orphans {
                    ContentUnit::stage_delete(&mut batch, id.key().clone());
                }
                for link in ContentArtifact::load_all(&*tx)? {
                    if orphans.contains(&link.model.content) {
                        link.stage_delete(&mut batch);
                    }
                }
                tx.apply(&batch)?;
                Ok(orphans.len())
            })
            .inspect(|removed| {
                if *removed > 0 {
                    tracing::debug!(content_type = %content_type, removed, "orphan content removed");
                }
            })
    }

    /// Delete artifact records nothing links to. Returns the removed
    /// artifacts so their bytes can be deleted once the records are gone.
    fn remove_orphan_artifacts(&self) -> TransactionResult<Vec<Stored<Artifact>>> {
        self.manager.with_retries(self.max_attempts, TransactionError::is_retryable, |tx| {
            let linked: HashSet<ArtifactId> = ContentArtifact::load_all(&*tx)?
                .into_iter()
                .map(|link| link.model.artifact)
                .collect();
            let orphans: Vec<Stored<Artifact>> = Artifact::load_all(&*tx)?
                .into_iter()
                .filter(|artifact| !linked.contains(&artifact.id::<ArtifactId>()))
                .collect();
            if orphans.is_empty() {
                return Ok(orphans);
            }

            let mut batch = WriteBatch::new("remove orphan artifacts");
            for artifact in &orphans {
                artifact.stage_delete(&mut batch);
            }
            tx.apply(&batch)?;
            Ok(orphans)
        })
    }
}

/// Every content reference with an open ledger entry in any repository.
fn active_content(view: &impl ReadView) -> TransactionResult<HashSet<ContentRef>> {
    Ok(RepositoryContent::load_all(view)?
        .into_iter()
        .filter(|entry| entry.model.is_active())
        .map(|entry| entry.model.content())
        .collect())
}
