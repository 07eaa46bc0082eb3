//! Pet Door Monitor
//!
//! Watches a doorway camera, classifies motion events as cat, dog, or
//! unknown, and keeps each event as a JPEG plus JSON sidecar under a bounded
//! local store.
//!
//! # Architecture
//!
//! Each tick of the pipeline runs, and stops at the first stage that fails:
//!
//! 1. **Capture** one frame from the configured source.
//! 2. **Motion gate**: blurred grayscale diff against a slowly adapting
//!    background. The first frame only seeds the background.
//! 3. **Debounce**: at most one accepted event per cooldown window.
//! 4. **Classify**: only cats and dogs at or above the confidence threshold.
//! 5. **Persist**: image first, then sidecar, under `cats/`, `dogs/` or
//!    `unknown/`.
//! 6. **Capacity**: over the high-water mark, evict the oldest 20% of pairs.
//!
//! No stage failure ends the loop. The management API reads state and
//! changes config through a [`PipelineHandle`] while the worker runs.
//!
//! # Module Structure
//!
//! - `frame`: captured frames and JPEG encoding
//! - `ingest`: frame sources (synthetic, scripted, V4L2)
//! - `detect`: motion gate, debouncer, classifier boundary and backends
//! - `evidence`, `storage`: evidence writer and on-disk layout
//! - `capacity`: high-water-mark eviction
//! - `pipeline`: orchestrator, shared state, worker thread
//! - `api`: management HTTP interface
//! - `config`, `error`: configuration and stage failure kinds

pub mod api;
pub mod capacity;
pub mod config;
pub mod detect;
pub mod error;
pub mod evidence;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod storage;

pub use capacity::{CapacityController, EvictionReport};
pub use config::{MonitorConfig, PipelineConfig, Resolution, SharedConfig};
pub use detect::{ClassifierBoundary, DetectionRecord, DetectionType, ObjectClassifier};
pub use error::PipelineError;
pub use evidence::{categorize, EvidenceWriter};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource};
pub use pipeline::{Pipeline, PipelineHandle, PipelineWorker, StatusSnapshot, TickOutcome};
pub use storage::{Category, EvidenceEntry, EvidenceListing, EvidenceStore};
