//! Ensemble checkpoints.
//!
//! Full snapshots are written as ensemble output (`ensbl_<lat>_<lon>.json`);
//! reduced snapshots are real-time restart checkpoints
//! (`init_<lat>_<lon>.json`). Loading distinguishes a missing checkpoint,
//! which callers answer with a fresh ensemble, from an unreadable one.

use super::config::RunSetup;
use super::ensemble::{Ensemble, EnsembleSnapshot, SnapshotKind};
use super::errors::{DaError, DaResult, PersistenceError};
use super::traits::PersistenceProvider;
use super::types::CellIndex;

/// Storage key of a full ensemble snapshot.
pub fn ensemble_key(cell: CellIndex) -> String {
    format!("ensbl_{}.json", cell.tag())
}

/// Storage key of a restart checkpoint.
pub fn restart_key(cell: CellIndex) -> String {
    format!("init_{}.json", cell.tag())
}

/// Saves and restores ensembles through a persistence provider.
pub struct RestartManager<'a> {
    store: &'a dyn PersistenceProvider,
}

impl<'a> RestartManager<'a> {
    /// Create a new manager on top of `store`.
    pub fn new(store: &'a dyn PersistenceProvider) -> Self {
        Self { store }
    }

    /// Key a snapshot of the given kind is stored under.
    pub fn key(kind: SnapshotKind, cell: CellIndex) -> String {
        match kind {
            SnapshotKind::Full => ensemble_key(cell),
            SnapshotKind::Reduced => restart_key(cell),
        }
    }

    /// Serialize a projection of `ensemble`. Returns the key written.
    pub fn save(&self, ensemble: &Ensemble, kind: SnapshotKind) -> DaResult<String> {
        let key = Self::key(kind, ensemble.cell());
        let bytes = serde_json::to_vec(&ensemble.snapshot(kind)).map_err(|e| {
            DaError::from(PersistenceError::Io {
                key: key.clone(),
                reason: e.to_string(),
            })
        })?;
        self.store.write(&key, &bytes)?;
        log::debug!("Saved {:?} ensemble snapshot '{}'", kind, key);
        Ok(key)
    }

    /// Restore the checkpoint of `cell`.
    ///
    /// `Ok(None)` when nothing is stored; corrupt checkpoints and checkpoints
    /// that do not match the configuration are errors.
    pub fn load(
        &self,
        cell: CellIndex,
        kind: SnapshotKind,
        setup: &RunSetup,
    ) -> DaResult<Option<Ensemble>> {
        let key = Self::key(kind, cell);
        let bytes = match self.store.read(&key) {
            Ok(bytes) => bytes,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let snapshot: EnsembleSnapshot =
            serde_json::from_slice(&bytes).map_err(|e| PersistenceError::Corrupt {
                key: key.clone(),
                reason: e.to_string(),
            })?;
        if snapshot.cell != cell {
            return Err(PersistenceError::Corrupt {
                key,
                reason: format!("snapshot belongs to cell {}", snapshot.cell.tag()),
            }
            .into());
        }
        Ensemble::from_snapshot(snapshot, setup).map(Some)
    }

    /// Restore the checkpoint of `cell`, or build a fresh ensemble when none
    /// exists.
    pub fn load_or_else(
        &self,
        cell: CellIndex,
        kind: SnapshotKind,
        setup: &RunSetup,
        fresh: impl FnOnce() -> Ensemble,
    ) -> DaResult<Ensemble> {
        match self.load(cell, kind, setup)? {
            Some(ensemble) => {
                log::info!("Cell {}: resuming from checkpoint", cell.tag());
                Ok(ensemble)
            }
            None => {
                log::info!("Cell {}: no checkpoint, starting a fresh ensemble", cell.tag());
                Ok(fresh())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assim::config::RunConfig;
    use crate::assim::ensemble::ForecastContext;
    use crate::assim::noise::NoiseGenerator;
    use crate::assim::types::{AssimilationWindow, ForcingTable, ModelState};
    use crate::common::rng::DrawRng;
    use crate::models::DegreeDayModel;
    use crate::storage::MemoryStore;

    fn setup(members: usize) -> RunSetup {
        RunSetup::new(RunConfig {
            ensemble_members: members,
            assimilated_variables: vec!["SWE".into()],
            ..RunConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_missing_checkpoint_is_none() {
        let store = MemoryStore::new();
        let manager = RestartManager::new(&store);
        let cell = CellIndex::new(1, 1);
        assert!(manager.load(cell, SnapshotKind::Reduced, &setup(3)).unwrap().is_none());

        let fresh = manager
            .load_or_else(cell, SnapshotKind::Reduced, &setup(3), || {
                Ensemble::new(cell, 3, ModelState::zeros(2))
            })
            .unwrap();
        assert!(!fresh.is_restarted());
    }

    #[test]
    fn test_save_and_load() {
        let store = MemoryStore::new();
        let manager = RestartManager::new(&store);
        let cell = CellIndex::new(2, 5);
        let ensemble = Ensemble::new(cell, 3, ModelState::from_vec(vec![1.0, 2.0]));
        assert_eq!(manager.save(&ensemble, SnapshotKind::Reduced).unwrap(), "init_2_5.json");

        let restored = manager
            .load(cell, SnapshotKind::Reduced, &setup(3))
            .unwrap()
            .unwrap();
        assert!(restored.is_restarted());
        assert_eq!(restored.members()[1].state, ensemble.members()[1].state);
    }

    #[test]
    fn test_corrupt_checkpoint_is_error() {
        let store = MemoryStore::new();
        let cell = CellIndex::new(0, 0);
        store.write(&restart_key(cell), b"{not json").unwrap();
        let err = RestartManager::new(&store)
            .load(cell, SnapshotKind::Reduced, &setup(3))
            .unwrap_err();
        assert!(matches!(err, DaError::Persistence(PersistenceError::Corrupt { .. })));
    }

    #[test]
    fn test_member_count_mismatch() {
        let store = MemoryStore::new();
        let manager = RestartManager::new(&store);
        let cell = CellIndex::new(0, 0);
        manager
            .save(&Ensemble::new(cell, 4, ModelState::zeros(1)), SnapshotKind::Full)
            .unwrap();
        let err = manager.load(cell, SnapshotKind::Full, &setup(3)).unwrap_err();
        assert!(matches!(err, DaError::Configuration { .. }));
    }

    fn bits(values: &[f64]) -> Vec<u64> {
        values.iter().map(|v| v.to_bits()).collect()
    }

    #[test]
    fn test_full_snapshot_is_bit_exact() {
        let mut cfg = RunConfig {
            ensemble_members: 8,
            seed: Some(17),
            vars_to_perturbate: vec!["Prec".into(), "Tair".into()],
            perturbation_strategy: vec!["lognormal".into(), "normal".into()],
            assimilated_variables: vec!["SWE".into()],
            ..RunConfig::default()
        };
        for (v, sd) in [("Prec", 0.37), ("Tair", 0.83)] {
            cfg.mean_errors.insert(v.into(), 0.0);
            cfg.sd_errors.insert(v.into(), sd);
        }
        let setup = RunSetup::new(cfg).unwrap();
        let model = DegreeDayModel::default();
        let forcing = ForcingTable::from_columns(vec![
            ("Tair".into(), (0..12).map(|t| 266.1 + 0.713 * t as f64).collect()),
            ("Prec".into(), (0..12).map(|t| 1.0 / (t as f64 + 3.0)).collect()),
        ])
        .unwrap();
        let cell = CellIndex::new(4, 1);
        let ctx = ForecastContext::new(&setup, &model);
        let mut ensemble = Ensemble::fresh(&ctx, cell);
        let mut noise = NoiseGenerator::new(&setup, DrawRng::new(Some(17)));
        ensemble
            .create(&ctx, &mut noise, &forcing, AssimilationWindow::new(0, 0, 12), None)
            .unwrap();

        let store = MemoryStore::new();
        let manager = RestartManager::new(&store);
        manager.save(&ensemble, SnapshotKind::Full).unwrap();
        let restored = manager
            .load(cell, SnapshotKind::Full, &setup)
            .unwrap()
            .unwrap();

        for (a, b) in ensemble.members().iter().zip(restored.members()) {
            assert_eq!(bits(a.state.as_slice()), bits(b.state.as_slice()));
            for (na, nb) in a.noise.iter().zip(&b.noise) {
                assert_eq!(bits(na), bits(nb));
            }
            assert_eq!(
                bits(a.output.values().as_slice()),
                bits(b.output.values().as_slice())
            );
        }
    }
}
