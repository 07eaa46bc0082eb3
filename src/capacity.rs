//! Capacity controller: keeps evidence storage under the high-water mark by
//! evicting the oldest pairs in fixed-fraction batches.

use anyhow::Result;

use crate::config::bytes_to_gb;
use crate::error::PipelineError;
use crate::storage::EvidenceStore;

/// Fraction of all stored pairs removed by one pass over the mark.
pub const EVICTION_FRACTION: f64 = 0.2;

/// Source of the "bytes in use" figure compared against the mark.
pub trait UsageMeter: Send {
    fn used_bytes(&self, store: &EvidenceStore) -> Result<u64>;
}

/// Sums file sizes on disk.
#[derive(Default)]
pub struct DiskUsage;

impl UsageMeter for DiskUsage {
    fn used_bytes(&self, store: &EvidenceStore) -> Result<u64> {
        store.usage_bytes()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub usage_before: u64,
    pub usage_after: u64,
    pub attempted: usize,
    pub evicted: usize,
    pub failed: usize,
}

pub struct CapacityController {
    store: EvidenceStore,
    meter: Box<dyn UsageMeter>,
}

impl CapacityController {
    pub fn new(store: EvidenceStore) -> Self {
        Self::with_meter(store, Box::new(DiskUsage))
    }

    pub fn with_meter(store: EvidenceStore, meter: Box<dyn UsageMeter>) -> Self {
        Self { store, meter }
    }

    /// One capacity pass. Returns `None` when usage is at or under the mark.
    ///
    /// Over the mark, temp files from interrupted writes go first; if that is
    /// not enough, `floor(pairs * 0.2)` pairs are deleted oldest first. Unlike
    /// the plain formula the batch never drops below one pair, so a store of
    /// fewer than five pairs still shrinks. Each pair is removed
    /// independently; a failure is logged and the batch goes on. A single
    /// pass need not bring usage under the mark.
    pub fn enforce_limit(
        &self,
        high_water_mark_bytes: u64,
    ) -> Result<Option<EvictionReport>, PipelineError> {
        let _guard = self.store.lock();
        let usage_before = self.used_bytes()?;
        if usage_before <= high_water_mark_bytes {
            return Ok(None);
        }

        log::info!(
            "storage at {:.2}GB (limit {:.2}GB), cleaning up",
            bytes_to_gb(usage_before),
            bytes_to_gb(high_water_mark_bytes)
        );

        let leftovers = self.store.clear_leftovers().map_err(|err| PipelineError::Eviction {
            id: "<leftovers>".to_string(),
            reason: format!("{:#}", err),
        })?;
        if leftovers > 0 {
            log::info!("removed {} interrupted write(s)", leftovers);
            let usage = self.used_bytes()?;
            if usage <= high_water_mark_bytes {
                return Ok(Some(EvictionReport {
                    usage_before,
                    usage_after: usage,
                    ..EvictionReport::default()
                }));
            }
        }

        let mut pairs = self.store.scan_pairs().map_err(|err| PipelineError::Eviction {
            id: "<scan>".to_string(),
            reason: format!("{:#}", err),
        })?;
        pairs.sort_by(|a, b| a.captured_at.cmp(&b.captured_at).then_with(|| a.id.cmp(&b.id)));

        let batch = batch_size(pairs.len());
        let mut report = EvictionReport {
            usage_before,
            attempted: batch,
            ..EvictionReport::default()
        };
        for pair in pairs.iter().take(batch) {
            match self.store.remove_pair(pair) {
                Ok(()) => {
                    report.evicted += 1;
                    log::debug!("evicted {}/{}", pair.category, pair.id);
                }
                Err(err) => {
                    report.failed += 1;
                    let err = PipelineError::Eviction {
                        id: format!("{}/{}", pair.category, pair.id),
                        reason: format!("{:#}", err),
                    };
                    log::warn!("{}", err);
                }
            }
        }

        report.usage_after = self.used_bytes().unwrap_or(usage_before);
        log::info!(
            "cleanup complete: evicted {} of {} pair(s), storage now {:.2}GB",
            report.evicted,
            pairs.len(),
            bytes_to_gb(report.usage_after)
        );
        Ok(Some(report))
    }

    fn used_bytes(&self) -> Result<u64, PipelineError> {
        self.meter
            .used_bytes(&self.store)
            .map_err(|err| PipelineError::Eviction {
                id: "<usage>".to_string(),
                reason: format!("{:#}", err),
            })
    }
}

/// `floor(count * 0.2)`, raised to one (a departure from the bare formula)
/// so a small store over the mark still shrinks.
pub fn batch_size(count: usize) -> usize {
    let batch = (count as f64 * EVICTION_FRACTION).floor() as usize;
    batch.max(1).min(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::gb_to_bytes;
    use crate::storage::{Category, EvidenceMetadata};
    use std::collections::VecDeque;
    use std::fs;
    use std::sync::Mutex;

    /// Replays a fixed sequence of usage readings.
    struct ScriptedUsage(Mutex<VecDeque<u64>>);

    impl ScriptedUsage {
        fn new(readings: &[u64]) -> Self {
            Self(Mutex::new(readings.iter().copied().collect()))
        }
    }

    impl UsageMeter for ScriptedUsage {
        fn used_bytes(&self, _store: &EvidenceStore) -> Result<u64> {
            let mut readings = self.0.lock().unwrap();
            let next = readings.front().copied().unwrap_or(0);
            if readings.len() > 1 {
                readings.pop_front();
            }
            Ok(next)
        }
    }

    fn seed(store: &EvidenceStore, count: usize) -> Result<()> {
        // Spread across categories; hour encodes age, so "00" is oldest.
        for i in 0..count {
            let category = Category::ALL[i % 3];
            let id = format!("20240101_{:02}0000", i);
            let dir = store.category_dir(category);
            fs::write(dir.join(format!("{id}.jpg")), vec![0u8; 64])?;
            let meta = EvidenceMetadata {
                timestamp: format!("2024-01-01T{:02}:00:00+00:00", i),
                category,
                detections: vec![],
                filename: format!("{id}.jpg"),
            };
            fs::write(dir.join(format!("{id}.json")), serde_json::to_vec(&meta)?)?;
        }
        Ok(())
    }

    fn remaining_ids(store: &EvidenceStore) -> Result<Vec<String>> {
        let mut ids: Vec<String> = store.scan_pairs()?.into_iter().map(|p| p.id).collect();
        ids.sort();
        Ok(ids)
    }

    #[test]
    fn evicts_oldest_fifth_then_stops() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 10)?;
        let meter = ScriptedUsage::new(&[gb_to_bytes(12.0), gb_to_bytes(9.6), gb_to_bytes(9.6)]);
        let controller = CapacityController::with_meter(store.clone(), Box::new(meter));

        let report = controller.enforce_limit(gb_to_bytes(10.0))?.expect("over the mark");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.evicted, 2);
        assert_eq!(report.failed, 0);

        let ids = remaining_ids(&store)?;
        assert_eq!(ids.len(), 8);
        assert!(!ids.contains(&"20240101_000000".to_string()));
        assert!(!ids.contains(&"20240101_010000".to_string()));
        for pair in store.scan_pairs()? {
            assert!(pair.image.is_some() && pair.metadata.is_some());
        }

        assert!(controller.enforce_limit(gb_to_bytes(10.0))?.is_none());
        assert_eq!(remaining_ids(&store)?.len(), 8);
        Ok(())
    }

    #[test]
    fn batch_is_a_fifth_with_a_floor_of_one() {
        assert_eq!(batch_size(10), 2);
        assert_eq!(batch_size(14), 2);
        assert_eq!(batch_size(15), 3);
        assert_eq!(batch_size(3), 1);
        assert_eq!(batch_size(0), 0);
    }

    #[test]
    fn under_the_mark_is_a_no_op() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 5)?;
        let controller = CapacityController::new(store.clone());
        assert!(controller.enforce_limit(gb_to_bytes(10.0))?.is_none());
        assert_eq!(remaining_ids(&store)?.len(), 5);
        Ok(())
    }

    #[test]
    fn repeated_passes_converge_on_real_disk_usage() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 10)?;
        let limit = store.usage_bytes()? / 2;
        let controller = CapacityController::new(store.clone());

        let mut passes = 0;
        while controller.enforce_limit(limit)?.is_some() {
            passes += 1;
            assert!(passes < 10, "capacity never converged");
        }
        assert!(store.usage_bytes()? <= limit);
        assert!(passes > 1);
        Ok(())
    }

    #[test]
    fn orphans_are_evicted_by_mtime() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 4)?;
        // Orphan image whose mtime is "now", newer than every seeded sidecar.
        fs::write(store.category_dir(Category::Cats).join("orphan.jpg"), vec![0u8; 64])?;
        let meter = ScriptedUsage::new(&[u64::MAX]);
        let controller = CapacityController::with_meter(store.clone(), Box::new(meter));

        let report = controller.enforce_limit(0)?.expect("over the mark");
        assert_eq!(report.evicted, 1);
        let ids = remaining_ids(&store)?;
        assert!(ids.contains(&"orphan".to_string()));
        assert!(!ids.contains(&"20240101_000000".to_string()));
        Ok(())
    }

    #[test]
    fn interrupted_writes_do_not_pin_usage_over_the_mark() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        let leftover = store.category_dir(Category::Cats).join("20240101_000000.json.tmp");
        fs::write(&leftover, vec![0u8; 1000])?;
        let controller = CapacityController::new(store.clone());

        let report = controller.enforce_limit(500)?.expect("over the mark");
        assert_eq!(report.usage_before, 1000);
        assert_eq!(report.usage_after, 0);
        assert!(!leftover.exists());
        assert!(controller.enforce_limit(500)?.is_none());
        Ok(())
    }

    #[test]
    fn leftovers_are_cleared_before_pairs_are_evicted() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 5)?;
        fs::write(
            store.category_dir(Category::Dogs).join("20240101_990000.json.tmp"),
            vec![0u8; 4096],
        )?;
        let limit = store.usage_bytes()? - 1024;
        let controller = CapacityController::new(store.clone());

        let report = controller.enforce_limit(limit)?.expect("over the mark");
        assert_eq!(report.attempted, 0);
        assert!(report.usage_after <= limit);
        assert_eq!(remaining_ids(&store)?.len(), 5);
        Ok(())
    }

    #[test]
    fn one_stuck_pair_does_not_abort_the_batch() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let store = EvidenceStore::open(temp.path())?;
        seed(&store, 10)?;
        // A directory where the oldest image should be cannot be unlinked.
        let stuck = store.category_dir(Category::Cats).join("20240101_000000.jpg");
        fs::remove_file(&stuck)?;
        fs::create_dir(&stuck)?;
        fs::write(stuck.join("keep"), b"x")?;
        let meter = ScriptedUsage::new(&[u64::MAX, 0]);
        let controller = CapacityController::with_meter(store.clone(), Box::new(meter));

        let report = controller.enforce_limit(0)?.expect("over the mark");
        assert_eq!(report.attempted, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.evicted, 1);

        let ids = remaining_ids(&store)?;
        assert!(ids.contains(&"20240101_000000".to_string()));
        assert!(!ids.contains(&"20240101_010000".to_string()));
        assert_eq!(ids.len(), 9);
        Ok(())
    }
}
