//! Persistence collaborator: opaque blobs addressed by directory, key and kind,
//! plus typed helpers for the objects the engine stores.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use hashbrown::HashMap;

use crate::catalog::{shared, EntityKey};
use crate::dataset::{Dataset, SignalStream};
use crate::error::EngineError;
use crate::hidden_state::{HiddenStateModel, ObservationClusterer, TransitionModel};
use crate::model::PredictiveModel;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlobKind {
    Dataset,
    Model,
}

impl BlobKind {
    pub fn extension(self) -> &'static str {
        match self {
            BlobKind::Dataset => "ds",
            BlobKind::Model => "model",
        }
    }
}

pub trait Store: Send + Sync {
    /// `Ok(None)` when nothing is stored under the key.
    fn load(&self, dir: &Path, key: &EntityKey, kind: BlobKind) -> io::Result<Option<Vec<u8>>>;

    fn save(&self, dir: &Path, key: &EntityKey, kind: BlobKind, bytes: &[u8]) -> io::Result<()>;

    /// Remove every blob stored in `dir`; returns how many were removed.
    fn clear(&self, dir: &Path) -> io::Result<usize>;
}

/// One file per blob: `<dir>/<key>.<ext>`, written through a temporary file and renamed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileStore;

impl FileStore {
    pub fn path_for(dir: &Path, key: &EntityKey, kind: BlobKind) -> PathBuf {
        dir.join(format!("{}.{}", key, kind.extension()))
    }
}

impl Store for FileStore {
    fn load(&self, dir: &Path, key: &EntityKey, kind: BlobKind) -> io::Result<Option<Vec<u8>>> {
        match fs::read(Self::path_for(dir, key, kind)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn save(&self, dir: &Path, key: &EntityKey, kind: BlobKind, bytes: &[u8]) -> io::Result<()> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, key, kind);
        let tmp = path.with_extension(format!("{}.tmp", kind.extension()));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)
    }

    fn clear(&self, dir: &Path) -> io::Result<usize> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let mut removed = 0;
        for entry in entries {
            let path = entry?.path();
            let ours = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == BlobKind::Dataset.extension() || e == BlobKind::Model.extension());
            if ours {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// In-memory store for tests and demos.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<(PathBuf, EntityKey, BlobKind), Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().map(|b| b.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, dir: &Path, key: &EntityKey, kind: BlobKind) -> bool {
        self.blobs
            .lock()
            .map(|b| b.contains_key(&(dir.to_path_buf(), key.clone(), kind)))
            .unwrap_or(false)
    }
}

fn poisoned() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "memory store lock poisoned")
}

impl Store for MemoryStore {
    fn load(&self, dir: &Path, key: &EntityKey, kind: BlobKind) -> io::Result<Option<Vec<u8>>> {
        let blobs = self.blobs.lock().map_err(|_| poisoned())?;
        Ok(blobs.get(&(dir.to_path_buf(), key.clone(), kind)).cloned())
    }

    fn save(&self, dir: &Path, key: &EntityKey, kind: BlobKind, bytes: &[u8]) -> io::Result<()> {
        let mut blobs = self.blobs.lock().map_err(|_| poisoned())?;
        blobs.insert((dir.to_path_buf(), key.clone(), kind), bytes.to_vec());
        Ok(())
    }

    fn clear(&self, dir: &Path) -> io::Result<usize> {
        let mut blobs = self.blobs.lock().map_err(|_| poisoned())?;
        let before = blobs.len();
        blobs.retain(|(d, _, _), _| d != dir);
        Ok(before - blobs.len())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Typed helpers
// ═══════════════════════════════════════════════════════════════════════════

pub fn load_dataset(store: &dyn Store, dir: &Path, key: &EntityKey) -> io::Result<Option<Dataset>> {
    store
        .load(dir, key, BlobKind::Dataset)?
        .map(|b| Dataset::from_bytes(&b))
        .transpose()
}

pub fn save_dataset(store: &dyn Store, dir: &Path, key: &EntityKey, data: &Dataset) -> io::Result<()> {
    store.save(dir, key, BlobKind::Dataset, &data.to_bytes()?)
}

pub fn load_stream(store: &dyn Store, dir: &Path, device_id: &str) -> io::Result<Option<SignalStream>> {
    let key = EntityKey::new(shared::STREAM, device_id);
    store
        .load(dir, &key, BlobKind::Dataset)?
        .map(|b| SignalStream::from_bytes(&b))
        .transpose()
}

pub fn save_stream(store: &dyn Store, dir: &Path, device_id: &str, stream: &SignalStream) -> io::Result<()> {
    let key = EntityKey::new(shared::STREAM, device_id);
    store.save(dir, &key, BlobKind::Dataset, &stream.to_bytes()?)
}

/// Load one entity's model; missing and corrupt files are both reported as [`EngineError::ModelLoad`].
pub fn load_model(
    store: &dyn Store,
    dir: &Path,
    key: &EntityKey,
    entity: &str,
) -> Result<PredictiveModel, EngineError> {
    let fail = |reason: String| EngineError::ModelLoad {
        entity: entity.to_string(),
        reason,
    };
    let bytes = store
        .load(dir, key, BlobKind::Model)
        .map_err(|e| fail(e.to_string()))?
        .ok_or_else(|| fail("no model file".to_string()))?;
    PredictiveModel::from_bytes(&bytes).map_err(|e| fail(e.to_string()))
}

pub fn save_model(store: &dyn Store, dir: &Path, key: &EntityKey, model: &PredictiveModel) -> io::Result<()> {
    store.save(dir, key, BlobKind::Model, &model.to_bytes()?)
}

/// The clusterer and chain are stored under separate keys and only accepted as a matching pair.
pub fn load_state_model(
    store: &dyn Store,
    dir: &Path,
    device_id: &str,
) -> Result<Option<HiddenStateModel>, EngineError> {
    let clusters_key = EntityKey::new(shared::CLUSTERS, device_id);
    let chain_key = EntityKey::new(shared::TRANSITIONS, device_id);
    let (Some(clusters), Some(chain)) = (
        store.load(dir, &clusters_key, BlobKind::Model)?,
        store.load(dir, &chain_key, BlobKind::Model)?,
    ) else {
        return Ok(None);
    };
    let fail = |reason: String| EngineError::ModelLoad {
        entity: "state model".to_string(),
        reason,
    };
    let clusterer = ObservationClusterer::from_bytes(&clusters).map_err(|e| fail(e.to_string()))?;
    let transitions = TransitionModel::from_bytes(&chain).map_err(|e| fail(e.to_string()))?;
    HiddenStateModel::new(clusterer, transitions)
        .map(Some)
        .ok_or_else(|| fail("clusterer and chain do not match".to_string()))
}

pub fn save_state_model(
    store: &dyn Store,
    dir: &Path,
    device_id: &str,
    model: &HiddenStateModel,
) -> io::Result<()> {
    store.save(
        dir,
        &EntityKey::new(shared::CLUSTERS, device_id),
        BlobKind::Model,
        &model.clusterer().to_bytes()?,
    )?;
    store.save(
        dir,
        &EntityKey::new(shared::TRANSITIONS, device_id),
        BlobKind::Model,
        &model.transitions().to_bytes()?,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::MeasurementSample;

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("resonanz-store-{tag}-{}", std::process::id()))
    }

    #[test]
    fn file_store_round_trips_and_clears() {
        let dir = temp_dir("files");
        let key = EntityKey::new("calm", "dev");
        let mut ds = Dataset::new();
        ds.push(MeasurementSample::from_readings(&[0.5], &[0.6], 0.2, vec![1.0], vec![], 1).unwrap());

        assert!(load_dataset(&FileStore, &dir, &key).unwrap().is_none());
        save_dataset(&FileStore, &dir, &key, &ds).unwrap();
        assert_eq!(load_dataset(&FileStore, &dir, &key).unwrap(), Some(ds));

        assert_eq!(FileStore.clear(&dir).unwrap(), 1);
        assert!(load_dataset(&FileStore, &dir, &key).unwrap().is_none());
        let _ = fs::remove_dir_all(dir);
    }

    #[test]
    fn corrupt_model_is_a_model_load_error() {
        let store = MemoryStore::new();
        let dir = Path::new("models");
        let key = EntityKey::new("storm", "dev");
        store.save(dir, &key, BlobKind::Model, b"definitely not a model").unwrap();
        let err = load_model(&store, dir, &key, "storm").unwrap_err();
        assert!(matches!(err, EngineError::ModelLoad { ref entity, .. } if entity == "storm"));

        let missing = load_model(&store, dir, &EntityKey::new("none", "dev"), "none");
        assert!(matches!(missing, Err(EngineError::ModelLoad { .. })));
    }

    #[test]
    fn memory_store_clear_is_per_directory() {
        let store = MemoryStore::new();
        let key = EntityKey::new("k", "d");
        store.save(Path::new("a"), &key, BlobKind::Model, &[1]).unwrap();
        store.save(Path::new("b"), &key, BlobKind::Model, &[2]).unwrap();
        assert_eq!(store.clear(Path::new("a")).unwrap(), 1);
        assert!(store.contains(Path::new("b"), &key, BlobKind::Model));
    }
}
