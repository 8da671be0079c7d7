//! Reclaiming content and artifacts no repository refers to anymore.

mod blob;
mod progress;
mod reclaim;

pub use blob::{BlobError, BlobStorage, FsBlobStorage, MemoryBlobStorage};
pub use progress::{ProgressReport, ProgressSink, ProgressState, RecordingProgress, TracingProgress};
pub use reclaim::{OrphanReclaimer, ReclaimReport};
