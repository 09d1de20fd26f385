//! Signature store: run-scoped handles to sketch artifacts.
//!
//! Every sketch is created at most once. Concurrent requests for the same
//! sketch wait on a shared `OnceCell`, so all sample branches observe the same
//! completed reference sketch instead of building it again.

use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;

/// Which variant of a source's sketch a key names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SketchVariant {
    /// The reference collection's sketch
    Reference,
    /// A sample's own sketch
    Base,
    /// The abundance-filtered sketch of a sample
    Filtered,
}

/// Key identifying one sketch in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SketchKey {
    pub owner: String,
    pub variant: SketchVariant,
}

impl SketchKey {
    pub fn base(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            variant: SketchVariant::Base,
        }
    }

    pub fn reference(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            variant: SketchVariant::Reference,
        }
    }

    pub fn filtered(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            variant: SketchVariant::Filtered,
        }
    }
}

/// How a sketch came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SketchOrigin {
    /// Supplied by the user as a pre-built artifact
    Supplied,
    /// Built by the sketch tool during this run
    Built,
    /// Produced by the abundance filter
    Filtered,
}

/// An immutable sketch artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Sketch {
    /// Identifier of the owning sequence source
    pub owner: String,
    pub path: PathBuf,
    pub origin: SketchOrigin,
}

impl Sketch {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

type Slot = Arc<OnceCell<Arc<Sketch>>>;

/// Ownership-tracked sketch handles for one run.
#[derive(Debug, Default)]
pub struct SignatureStore {
    slots: Mutex<HashMap<SketchKey, Slot>>,
}

impl SignatureStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &SketchKey) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.entry(key.clone()).or_default().clone()
    }

    /// Register a pre-built sketch. Returns `false` if the key already held one.
    pub fn supply(&self, key: SketchKey, path: PathBuf) -> bool {
        let sketch = Arc::new(Sketch {
            owner: key.owner.clone(),
            path,
            origin: SketchOrigin::Supplied,
        });
        self.slot(&key).set(sketch).is_ok()
    }

    /// Return the sketch for `key`, running `build` only if no sketch exists yet.
    ///
    /// Callers racing on the same key wait for the first builder; if it fails
    /// the next caller tries again.
    pub async fn get_or_build<F, Fut, E>(&self, key: &SketchKey, build: F) -> Result<Arc<Sketch>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Sketch, E>>,
    {
        let slot = self.slot(key);
        let sketch = slot
            .get_or_try_init(|| async move { build().await.map(Arc::new) })
            .await?;
        Ok(Arc::clone(sketch))
    }

    /// The sketch for `key`, if it has been created.
    pub fn get(&self, key: &SketchKey) -> Option<Arc<Sketch>> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(key).and_then(|slot| slot.get().cloned())
    }

    /// Number of sketches created so far.
    pub fn len(&self) -> usize {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn built(owner: &str) -> Sketch {
        Sketch {
            owner: owner.to_string(),
            path: PathBuf::from(format!("{}.sig", owner)),
            origin: SketchOrigin::Built,
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_build_once() {
        let store = Arc::new(SignatureStore::new());
        let builds = Arc::new(AtomicUsize::new(0));
        let key = SketchKey::reference("refs");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            let builds = Arc::clone(&builds);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_build(&key, move || async move {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::task::yield_now().await;
                        Ok::<_, String>(built("reference"))
                    })
                    .await
            }));
        }

        let mut paths = Vec::new();
        for handle in handles {
            paths.push(handle.await.unwrap().unwrap().path.clone());
        }

        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(paths.iter().all(|p| p == &PathBuf::from("reference.sig")));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_build_can_be_retried() {
        let store = SignatureStore::new();
        let key = SketchKey::base("s1");

        let first = store
            .get_or_build(&key, || async { Err::<Sketch, _>("boom") })
            .await;
        assert!(first.is_err());
        assert!(store.get(&key).is_none());

        let second = store
            .get_or_build(&key, || async { Ok::<_, &str>(built("s1")) })
            .await
            .unwrap();
        assert_eq!(second.origin, SketchOrigin::Built);
    }

    #[tokio::test]
    async fn test_supplied_sketch_is_never_built() {
        let store = SignatureStore::new();
        let key = SketchKey::base("refs");
        assert!(store.supply(key.clone(), PathBuf::from("refs.sig")));
        assert!(!store.supply(key.clone(), PathBuf::from("other.sig")));

        let sketch = store
            .get_or_build(&key, || async {
                Err::<Sketch, _>("supplied sketch must not be rebuilt".to_string())
            })
            .await
            .unwrap();
        assert_eq!(sketch.origin, SketchOrigin::Supplied);
        assert_eq!(sketch.path(), Path::new("refs.sig"));
    }

    #[test]
    fn test_variants_are_distinct_keys() {
        let store = SignatureStore::new();
        store.supply(SketchKey::base("s"), PathBuf::from("s.sig"));
        assert!(store.get(&SketchKey::filtered("s")).is_none());
        assert!(store.get(&SketchKey::reference("s")).is_none());
        assert!(store.get(&SketchKey::base("s")).is_some());
    }
}
