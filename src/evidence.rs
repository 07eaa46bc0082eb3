//! Evidence writer: categorise a frame's detections and persist the pair.

use anyhow::Result;
use chrono::SecondsFormat;

use crate::detect::{DetectionRecord, DetectionType};
use crate::error::PipelineError;
use crate::frame::Frame;
use crate::storage::{
    write_atomic, write_new, Category, EvidenceEntry, EvidenceMetadata, EvidenceStore, IMAGE_EXT,
    METADATA_EXT,
};

/// Cat outranks dog; no qualifying detection means `unknown`.
pub fn categorize(detections: &[DetectionRecord]) -> Category {
    if detections.iter().any(|d| d.kind == DetectionType::Cat) {
        Category::Cats
    } else if detections.iter().any(|d| d.kind == DetectionType::Dog) {
        Category::Dogs
    } else {
        Category::Unknown
    }
}

pub struct EvidenceWriter {
    store: EvidenceStore,
}

impl EvidenceWriter {
    pub fn new(store: EvidenceStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    /// Encode and persist one entry: image first, then the sidecar.
    ///
    /// Ids are the capture second (`YYYYMMDD_HHMMSS`); a second write within
    /// the same second gets `_1`, `_2`, ... appended instead of replacing the
    /// earlier entry.
    pub fn write(
        &self,
        frame: &Frame,
        detections: &[DetectionRecord],
    ) -> Result<EvidenceEntry, PipelineError> {
        let category = categorize(detections);
        let jpeg = frame.encode_jpeg().map_err(PipelineError::persistence)?;

        let _guard = self.store.lock();
        let dir = self.store.category_dir(category);
        let base = frame.captured_at.format("%Y%m%d_%H%M%S").to_string();
        let id = self.unique_id(&base);
        let filename = format!("{}.{}", id, IMAGE_EXT);
        let image_path = dir.join(&filename);
        let metadata_path = dir.join(format!("{}.{}", id, METADATA_EXT));

        write_new(&image_path, &jpeg).map_err(PipelineError::persistence)?;

        let timestamp = frame.captured_at.fixed_offset();
        let metadata = EvidenceMetadata {
            timestamp: timestamp.to_rfc3339_opts(SecondsFormat::Micros, false),
            category,
            detections: detections.to_vec(),
            filename: filename.clone(),
        };
        if let Err(err) = write_metadata(&metadata_path, &metadata) {
            // Never leave an image without its sidecar.
            if let Err(cleanup) = std::fs::remove_file(&image_path) {
                log::warn!(
                    "failed to remove unpaired image {}: {}",
                    image_path.display(),
                    cleanup
                );
            }
            return Err(PipelineError::persistence(err));
        }

        log::info!(
            "saved: {}/{} - {} pet(s) detected",
            category,
            filename,
            detections.len()
        );

        Ok(EvidenceEntry {
            id,
            timestamp,
            category,
            detections: detections.to_vec(),
            image_path,
            metadata_path,
        })
    }

    fn unique_id(&self, base: &str) -> String {
        if !self.store.pair_exists(base) {
            return base.to_string();
        }
        (1u32..)
            .map(|n| format!("{}_{}", base, n))
            .find(|candidate| !self.store.pair_exists(candidate))
            .unwrap_or_else(|| base.to_string())
    }
}

fn write_metadata(path: &std::path::Path, metadata: &EvidenceMetadata) -> Result<()> {
    let json = serde_json::to_vec_pretty(metadata)?;
    write_atomic(path, &json)
}
