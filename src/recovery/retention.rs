use std::collections::HashMap;
use std::fs;

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::error::{WalError, WalResult};
use crate::recovery::archive::ArchiveStatus;
use crate::recovery::lsn::{SegNo, TimeLineId};
use crate::recovery::wal::SegmentFileManager;
use crate::recovery::Lsn;

/// Replication slots as seen by retention: each holds back WAL from its
/// restart position.
#[derive(Debug)]
pub struct ReplicationSlots {
    max_slots: usize,
    slots: Mutex<HashMap<String, Lsn>>,
}

impl ReplicationSlots {
    pub fn new(max_slots: usize) -> Self {
        Self {
            max_slots,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_slots(&self) -> usize {
        self.max_slots
    }

    /// Creates or advances a slot.
    pub fn set(&self, name: &str, restart_lsn: Lsn) -> WalResult<()> {
        let mut slots = self.slots.lock();
        if !slots.contains_key(name) && slots.len() >= self.max_slots {
            return Err(WalError::InvalidConfig(format!(
                "all replication slots are in use (max_replication_slots = {})",
                self.max_slots
            )));
        }
        slots.insert(name.to_string(), restart_lsn);
        Ok(())
    }

    pub fn drop_slot(&self, name: &str) -> bool {
        self.slots.lock().remove(name).is_some()
    }

    /// Oldest restart position over all slots, `INVALID` when none.
    pub fn min_required(&self) -> Lsn {
        self.slots
            .lock()
            .values()
            .copied()
            .filter(|lsn| lsn.is_valid())
            .min()
            .unwrap_or(Lsn::INVALID)
    }
}

/// Result of applying the keep policies to a removal cutoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepDecision {
    /// Segments strictly below this one may go.
    pub segno: SegNo,
    /// A slot is holding WAL older than the prior checkpoint's redo.
    pub keep_old_wals: bool,
}

/// Redo pointers remembered across checkpoints while a slot lags behind.
#[derive(Debug, Default)]
struct SlotLag {
    redo_after_prior_min: Lsn,
    redo_before_min: Lsn,
}

/// Decides how far back WAL must be kept and removes or recycles what is
/// older.
#[derive(Debug)]
pub struct Retention {
    segment_size: u64,
    keep_segments: i64,
    recycle_slop: u64,
    lag: Mutex<SlotLag>,
}

impl Retention {
    pub fn new(segment_size: u64, keep_segments: i64, recycle_slop: u64) -> Self {
        Self {
            segment_size,
            keep_segments,
            recycle_slop,
            lag: Mutex::new(SlotLag::default()),
        }
    }

    /// Pulls the removal cutoff `delete_upto` back so that the keep window
    /// behind `current` and the slot minimum survive. `prior_redo` is the
    /// redo pointer of the previous checkpoint, or `INVALID` when unknown.
    pub fn keep_log_seg(
        &self,
        current: Lsn,
        delete_upto: SegNo,
        slots: &ReplicationSlots,
        prior_redo: Lsn,
    ) -> KeepDecision {
        let current_segno = current.segment(self.segment_size);
        let mut floor: Option<SegNo> = None;
        let mut keep_old_wals = false;

        if self.keep_segments > 0 {
            let keep = self.keep_segments as u64;
            floor = Some(if current_segno <= keep { 1 } else { current_segno - keep });
        }

        let slot_min = slots.min_required();
        if slots.max_slots() > 0 && slot_min.is_valid() {
            let keep = if prior_redo.is_valid() {
                self.slot_keep_point(slot_min, prior_redo, &mut keep_old_wals)
            } else {
                slot_min
            };
            let segno = floor.unwrap_or(current_segno);
            let slot_segno = keep.segment(self.segment_size);
            floor = Some(if slot_segno == 0 { 1 } else { slot_segno.min(segno) });
        }

        // Neither a keep window nor a slot: the cutoff stands.
        KeepDecision {
            segno: floor.map_or(delete_upto, |segno| segno.min(delete_upto)),
            keep_old_wals,
        }
    }

    /// Chooses between the slot minimum and a remembered checkpoint redo so a
    /// lagging slot does not pin WAL forever while still covering it.
    fn slot_keep_point(&self, slot_min: Lsn, prior_redo: Lsn, keep_old_wals: &mut bool) -> Lsn {
        if prior_redo <= slot_min {
            return prior_redo;
        }
        let mut lag = self.lag.lock();
        if !lag.redo_after_prior_min.is_valid() {
            lag.redo_after_prior_min = prior_redo;
            *keep_old_wals = true;
            slot_min
        } else if lag.redo_after_prior_min > slot_min {
            *keep_old_wals = true;
            slot_min
        } else {
            let keep = lag.redo_after_prior_min;
            debug!(
                "slot at {} passed held redo {} (previous hold {})",
                slot_min, keep, lag.redo_before_min
            );
            lag.redo_before_min = keep;
            lag.redo_after_prior_min = prior_redo;
            keep
        }
    }

    /// Removes or recycles segments older than `cutoff`. Recycled segments
    /// are renamed to future names at most `recycle_slop` past `current`.
    /// Returns (removed, recycled).
    pub fn remove_old_segments(
        &self,
        segments: &SegmentFileManager,
        archive: Option<&ArchiveStatus>,
        tli: TimeLineId,
        cutoff: SegNo,
        current: Lsn,
    ) -> WalResult<(usize, usize)> {
        let mut next_target = current.segment(self.segment_size);
        let mut budget = self.recycle_slop;
        let mut removed = 0;
        let mut recycled = 0;

        for segment in segments.list_segments()? {
            if segment.segno >= cutoff {
                break;
            }
            if let Some(archive) = archive {
                if !archive.is_done(&segment.name) {
                    debug!("segment {} not yet archived, keeping it", segment.name);
                    continue;
                }
            }
            let slot = if budget > 0 {
                segments.recycle(&segment, tli, next_target, budget)?
            } else {
                None
            };
            match slot {
                Some(segno) => {
                    debug!("recycled transaction log file \"{}\" as segment {}", segment.name, segno);
                    budget = budget.saturating_sub(segno - next_target + 1);
                    next_target = segno + 1;
                    recycled += 1;
                }
                None => {
                    debug!("removing transaction log file \"{}\"", segment.name);
                    segments.remove(&segment)?;
                    removed += 1;
                }
            }
            if let Some(archive) = archive {
                archive.cleanup(&segment.name);
            }
        }
        if removed + recycled > 0 {
            info!(
                "{} transaction log file(s) removed, {} recycled",
                removed, recycled
            );
        }
        Ok((removed, recycled))
    }

    /// Drops backup history files the archiver has finished with.
    pub fn cleanup_backup_history(
        &self,
        segments: &SegmentFileManager,
        archive: Option<&ArchiveStatus>,
    ) -> WalResult<()> {
        for entry in fs::read_dir(segments.directory())? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".backup") {
                continue;
            }
            if archive.is_some_and(|a| !a.is_done(&name)) {
                continue;
            }
            debug!("removing transaction log backup history file \"{}\"", name);
            if let Err(err) = fs::remove_file(entry.path()) {
                warn!("could not remove \"{}\": {}", name, err);
            }
            if let Some(archive) = archive {
                archive.cleanup(&name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recovery::lsn::segments_per_log_id;
    use crate::recovery::wal::XLOG_DIR;

    const SEG64: u64 = 64 * 1024 * 1024;

    fn at(log_id: u64, seg: u64) -> Lsn {
        Lsn::new((log_id << 32) | (SEG64 * seg))
    }

    fn per_id() -> u64 {
        segments_per_log_id(SEG64)
    }

    #[test]
    fn keep_window_pulls_cutoff_back() {
        let retention = Retention::new(SEG64, 194, 7);
        let slots = ReplicationSlots::new(0);
        let keep = |current, delete| retention.keep_log_seg(current, delete, &slots, Lsn::INVALID).segno;

        assert_eq!(keep(at(4, 1), 3 * per_id() + 10), 63);
        assert_eq!(keep(at(4, 1), 60), 60);
        assert_eq!(keep(at(5, 8), per_id() + 60), per_id() + 60);
        // Underflow clamps to segment 1.
        assert_eq!(keep(at(3, 1), 2 * per_id() + 1), 1);
        assert_eq!(keep(at(5, 8), 2 * per_id() + 8), 2 * per_id() + 6);

        for disabled in [0, -1] {
            let retention = Retention::new(SEG64, disabled, 7);
            let decision = retention.keep_log_seg(at(5, 8), 9 * per_id() + 45, &slots, Lsn::INVALID);
            assert_eq!(decision.segno, 9 * per_id() + 45);
            // Slots configured but none holding WAL leave it alone too.
            let idle_slots = ReplicationSlots::new(2);
            let decision = retention.keep_log_seg(at(5, 8), 9 * per_id() + 45, &idle_slots, at(5, 1));
            assert_eq!(decision, KeepDecision { segno: 9 * per_id() + 45, keep_old_wals: false });
        }
    }

    #[test]
    fn slot_minimum_without_prior_checkpoint() {
        let retention = Retention::new(SEG64, 0, 7);
        let slots = ReplicationSlots::new(1);
        slots.set("standby", at(3, 5)).unwrap();
        let decision = retention.keep_log_seg(at(4, 1), 4 * per_id() + 1, &slots, Lsn::INVALID);
        assert_eq!(decision.segno, 3 * per_id() + 5);

        slots.set("standby", at(4, 12)).unwrap();
        let decision = retention.keep_log_seg(at(4, 11), 4 * per_id() + 11, &slots, Lsn::INVALID);
        assert_eq!(decision.segno, 4 * per_id() + 11);
    }

    #[test]
    fn lagging_slot_tracks_prior_checkpoints() {
        let retention = Retention::new(SEG64, 0, 7);
        let slots = ReplicationSlots::new(1);

        slots.set("s", at(3, 5)).unwrap();
        let d = retention.keep_log_seg(at(5, 8), 5 * per_id() + 8, &slots, at(4, 10));
        assert_eq!(d, KeepDecision { segno: 3 * per_id() + 5, keep_old_wals: true });

        slots.set("s", at(3, 11)).unwrap();
        let d = retention.keep_log_seg(at(6, 3), 6 * per_id() + 3, &slots, at(5, 8));
        assert_eq!(d, KeepDecision { segno: 3 * per_id() + 11, keep_old_wals: true });

        slots.set("s", at(4, 11)).unwrap();
        let d = retention.keep_log_seg(at(7, 5), 7 * per_id() + 5, &slots, at(6, 3));
        assert_eq!(d, KeepDecision { segno: 4 * per_id() + 10, keep_old_wals: false });

        slots.set("s", at(7, 8)).unwrap();
        let d = retention.keep_log_seg(at(7, 10), 7 * per_id() + 10, &slots, at(7, 5));
        assert_eq!(d, KeepDecision { segno: 7 * per_id() + 5, keep_old_wals: false });
    }

    #[test]
    fn slot_capacity_is_enforced() {
        let slots = ReplicationSlots::new(1);
        slots.set("a", Lsn::new(10)).unwrap();
        assert!(slots.set("b", Lsn::new(5)).is_err());
        slots.set("a", Lsn::new(20)).unwrap();
        assert_eq!(slots.min_required(), Lsn::new(20));
        assert!(slots.drop_slot("a"));
        assert_eq!(slots.min_required(), Lsn::INVALID);
    }

    #[test]
    fn removes_and_recycles_below_cutoff() {
        const SEG: u64 = 64 * 1024;
        let dir = tempfile::TempDir::new().unwrap();
        let segments = SegmentFileManager::new(dir.path().join(XLOG_DIR), SEG, false, true).unwrap();
        for segno in 1..=6 {
            segments.create_or_open(1, segno, false).unwrap();
        }
        let archive = ArchiveStatus::new(segments.directory());
        for segno in 1..=3 {
            archive.mark_done(&crate::recovery::lsn::wal_file_name(1, segno, SEG)).unwrap();
        }
        // Segment 4 has not been archived yet.
        archive.notify_ready(&crate::recovery::lsn::wal_file_name(1, 4, SEG)).unwrap();

        let retention = Retention::new(SEG, 0, 2);
        let current = crate::recovery::lsn::segment_start(6, SEG) + 100;
        let (removed, recycled) = retention
            .remove_old_segments(&segments, Some(&archive), 1, 5, current)
            .unwrap();
        // Segment 1 becomes segment 7, using up the slop; 2 and 3 go.
        assert_eq!((removed, recycled), (2, 1));

        let left: Vec<SegNo> = segments.list_segments().unwrap().iter().map(|s| s.segno).collect();
        assert_eq!(left, vec![4, 5, 6, 7]);
        assert!(!archive.status_dir().join(format!("{}.done", crate::recovery::lsn::wal_file_name(1, 1, SEG))).exists());
    }
}
