//! C2 Phase Tracker: thread-safe read model of `{block, latest_epoch,
//! epoch_params, is_synced}`, grounded on the teacher's `CsmStatus` —
//! a small plain struct behind a lock, mutated from one place and read as a
//! consistent owned snapshot everywhere else.

use parking_lot::RwLock;

use mlnet_primitives::{BlockRef, EpochParams, EpochSnapshot, LatestEpoch};

/// Single mutator path is `update()`, called externally on every new block
/// (§6 "Phase tracker input"). Reads never block behind a mutator thanks to
/// the reader-preferring lock (§5).
pub struct PhaseTracker {
    inner: RwLock<EpochSnapshot>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(EpochSnapshot {
                block: BlockRef {
                    height: 0,
                    hash: String::new(),
                },
                latest_epoch: None,
                epoch_params: EpochParams {
                    generate_window: 0,
                    generate_wind_down: 0,
                    validate_window: 0,
                    validate_wind_down: 0,
                },
                is_synced: false,
            }),
        }
    }

    /// `Update(block, epoch, epoch_params, is_synced)` — the only mutator.
    pub fn update(
        &self,
        block: BlockRef,
        latest_epoch: Option<LatestEpoch>,
        epoch_params: EpochParams,
        is_synced: bool,
    ) {
        let mut guard = self.inner.write();
        *guard = EpochSnapshot {
            block,
            latest_epoch,
            epoch_params,
            is_synced,
        };
    }

    /// `GetCurrentEpochState()` — returns a consistent, owned snapshot.
    pub fn current(&self) -> EpochSnapshot {
        self.inner.read().clone()
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlnet_primitives::Phase;

    #[test]
    fn starts_not_synced() {
        let t = PhaseTracker::new();
        assert!(t.current().is_nil_or_not_synced());
    }

    #[test]
    fn update_is_visible_to_readers() {
        let t = PhaseTracker::new();
        t.update(
            BlockRef {
                height: 101,
                hash: "abc".into(),
            },
            Some(LatestEpoch {
                index: 1,
                poc_start_block_height: 100,
            }),
            EpochParams {
                generate_window: 10,
                generate_wind_down: 2,
                validate_window: 10,
                validate_wind_down: 2,
            },
            true,
        );
        let snap = t.current();
        assert!(!snap.is_nil_or_not_synced());
        assert_eq!(snap.phase(), Phase::PocGenerate);
    }
}
