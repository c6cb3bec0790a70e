//! Bounded LRU cache of loaded upsamplers.
//!
//! The cache is the only owner of model lifetime. Callers borrow a model through
//! a [`ModelLease`]; a leased model is never evicted, and a `get` that needs a
//! free slot while every resident model is leased blocks until a lease is
//! returned. Recency is an explicit monotonically increasing counter indexed by
//! a `BTreeMap`, so eviction order is exact and ties cannot occur.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Deref;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::{Result, UpscaleError};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::types::{Image, Precision};
use crate::upsampler::{ModelLoader, Upsampler};

/// A model resident in memory. Inference on one model is serialised.
pub struct ResidentModel {
    id: String,
    scale: u32,
    precision: Precision,
    precision_incompatible: bool,
    generation: u64,
    upsampler: Mutex<Option<Box<dyn Upsampler>>>,
    loader: Arc<dyn ModelLoader>,
}

impl ResidentModel {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Whether this model was loaded after failing in reduced precision.
    pub fn is_precision_incompatible(&self) -> bool {
        self.precision_incompatible
    }

    pub fn upsample(&self, tile: &Image) -> Result<Image> {
        let mut guard = self
            .upsampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let upsampler = guard
            .as_mut()
            .ok_or_else(|| UpscaleError::inference(format!("model {} was released", self.id)))?;
        upsampler.upsample(tile).map_err(|err| err.with_model_id(&self.id))
    }

    pub fn release_transient(&self) {
        let mut guard = self
            .upsampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(upsampler) = guard.as_mut() {
            upsampler.release_transient();
        }
    }
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        let upsampler = self
            .upsampler
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        drop(upsampler);
        debug!(model = %self.id, "Released model");
        self.loader.release(&self.id);
    }
}

impl std::fmt::Debug for ResidentModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResidentModel")
            .field("id", &self.id)
            .field("scale", &self.scale)
            .field("precision", &self.precision)
            .field("precision_incompatible", &self.precision_incompatible)
            .finish_non_exhaustive()
    }
}

/// Borrowed access to a resident model. Returning the lease (dropping it)
/// makes the model evictable again.
pub struct ModelLease {
    model: Arc<ResidentModel>,
    shared: Arc<CacheShared>,
}

impl Deref for ModelLease {
    type Target = ResidentModel;

    fn deref(&self) -> &ResidentModel {
        &self.model
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        let mut state = self.shared.lock_state();
        if let Some(entry) = state.entries.get_mut(&self.model.id) {
            if entry.model.generation == self.model.generation {
                entry.leases = entry.leases.saturating_sub(1);
            }
        }
        drop(state);
        self.shared.returned.notify_all();
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ModelLease").field(&*self.model).finish()
    }
}

struct CacheEntry {
    model: Arc<ResidentModel>,
    last_used: u64,
    leases: usize,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, CacheEntry>,
    order: BTreeMap<u64, String>,
    tick: u64,
    incompatible: HashSet<String>,
}

impl CacheState {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Mark `model_id` most recently used and take a lease on it.
    fn touch(&mut self, model_id: &str) -> Option<Arc<ResidentModel>> {
        let tick = self.next_tick();
        let entry = self.entries.get_mut(model_id)?;
        self.order.remove(&entry.last_used);
        entry.last_used = tick;
        entry.leases += 1;
        self.order.insert(tick, model_id.to_string());
        Some(Arc::clone(&entry.model))
    }

    fn least_recently_used_idle(&self) -> Option<String> {
        self.order
            .values()
            .find(|id| self.entries.get(*id).is_some_and(|entry| entry.leases == 0))
            .cloned()
    }

    fn detach(&mut self, model_id: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(model_id)?;
        self.order.remove(&entry.last_used);
        Some(entry)
    }
}

struct CacheShared {
    state: Mutex<CacheState>,
    returned: Condvar,
}

impl CacheShared {
    fn lock_state(&self) -> MutexGuard<'_, CacheState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct ModelCache {
    shared: Arc<CacheShared>,
    loader: Arc<dyn ModelLoader>,
    progress: Arc<ProgressSink>,
    capacity: usize,
    reduced_precision: bool,
}

impl ModelCache {
    /// `capacity` is the maximum number of resident models. With
    /// `reduced_precision` on, models load in half precision unless flagged.
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        progress: Arc<ProgressSink>,
        capacity: usize,
        reduced_precision: bool,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(UpscaleError::invalid("model cache capacity must be at least 1"));
        }
        Ok(Self {
            shared: Arc::new(CacheShared {
                state: Mutex::new(CacheState::default()),
                returned: Condvar::new(),
            }),
            loader,
            progress,
            capacity,
            reduced_precision,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn reduced_precision(&self) -> bool {
        self.reduced_precision
    }

    pub fn progress(&self) -> &Arc<ProgressSink> {
        &self.progress
    }

    /// Lease `model_id`, loading it (and evicting the least recently used idle
    /// model) if it is not resident.
    ///
    /// Blocks while the cache is full and every resident model is leased. A
    /// thread that already holds leases on all resident models must return one
    /// before calling this for a new model.
    pub fn get(&self, model_id: &str) -> Result<ModelLease> {
        if !self.loader.contains(model_id) {
            return Err(UpscaleError::NotFound {
                model_id: model_id.to_string(),
            });
        }

        let mut state = self.shared.lock_state();
        loop {
            if let Some(model) = state.touch(model_id) {
                debug!(model = %model_id, "Model cache hit");
                return Ok(self.lease(model));
            }
            if state.entries.len() < self.capacity {
                break;
            }
            match state.least_recently_used_idle() {
                Some(victim) => {
                    let evicted = state.detach(&victim);
                    info!(model = %victim, "Evicting least recently used model");
                    self.progress.emit(ProgressEvent::ModelEvicted { model_id: victim });
                    drop(evicted);
                }
                None => {
                    debug!(
                        model = %model_id,
                        resident = state.entries.len(),
                        "All resident models are leased, waiting for a lease to be returned"
                    );
                    state = self
                        .shared
                        .returned
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }

        let incompatible = state.incompatible.contains(model_id);
        let requested = if self.reduced_precision && !incompatible {
            Precision::Reduced
        } else {
            Precision::Full
        };

        info!(model = %model_id, precision = %requested, "Loading model");
        self.progress.emit(ProgressEvent::ModelLoading {
            model_id: model_id.to_string(),
        });

        let upsampler = self
            .loader
            .load(model_id, requested)
            .map_err(|err| as_load_error(model_id, err))?;
        let scale = upsampler.scale();
        let precision = upsampler.precision();
        let rejected = if scale == 0 {
            Some("model reports a scale of 0".to_string())
        } else if requested == Precision::Full && precision != Precision::Full {
            Some(format!(
                "full precision was requested but the model loaded in {precision} precision"
            ))
        } else {
            None
        };
        if let Some(message) = rejected {
            drop(upsampler);
            self.loader.release(model_id);
            return Err(UpscaleError::LoadError {
                model_id: model_id.to_string(),
                message,
            });
        }

        let generation = state.next_tick();
        let model = Arc::new(ResidentModel {
            id: model_id.to_string(),
            scale,
            precision,
            precision_incompatible: incompatible,
            generation,
            upsampler: Mutex::new(Some(upsampler)),
            loader: Arc::clone(&self.loader),
        });
        state.order.insert(generation, model_id.to_string());
        state.entries.insert(
            model_id.to_string(),
            CacheEntry {
                model: Arc::clone(&model),
                last_used: generation,
                leases: 1,
            },
        );
        drop(state);

        info!(model = %model_id, scale, precision = %precision, "Model loaded");
        self.progress.emit(ProgressEvent::ModelLoaded {
            model_id: model_id.to_string(),
            scale,
            precision,
        });

        Ok(self.lease(model))
    }

    /// Permanently flag `model_id` as unable to run in reduced precision,
    /// drop the resident copy, and load it again in full precision.
    ///
    /// If another caller already reloaded the model after flagging it, the
    /// resident full precision copy is leased instead.
    pub fn mark_incompatible_and_reload(&self, model_id: &str) -> Result<ModelLease> {
        {
            let mut state = self.shared.lock_state();
            state.incompatible.insert(model_id.to_string());
            let reloaded = state
                .entries
                .get(model_id)
                .is_some_and(|entry| entry.model.precision_incompatible);
            if reloaded {
                if let Some(model) = state.touch(model_id) {
                    debug!(model = %model_id, "Model already reloaded in full precision");
                    return Ok(self.lease(model));
                }
            }
            if state.detach(model_id).is_some() {
                info!(model = %model_id, "Unloaded model for full precision reload");
            }
        }
        self.shared.returned.notify_all();
        self.get(model_id)
    }

    /// Returns whether the model was resident. A leased model is removed from
    /// the cache now and released once its last lease is returned.
    pub fn unload(&self, model_id: &str) -> bool {
        let detached = self.shared.lock_state().detach(model_id);
        self.shared.returned.notify_all();
        match detached {
            Some(_) => {
                info!(model = %model_id, "Unloaded model");
                true
            }
            None => false,
        }
    }

    pub fn unload_all(&self) {
        let detached: Vec<CacheEntry> = {
            let mut state = self.shared.lock_state();
            state.order.clear();
            state.entries.drain().map(|(_, entry)| entry).collect()
        };
        self.shared.returned.notify_all();
        if !detached.is_empty() {
            info!(count = detached.len(), "Unloaded all models");
        }
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.shared.lock_state().entries.contains_key(model_id)
    }

    /// Resident model ids, least recently used first.
    pub fn loaded_model_ids(&self) -> Vec<String> {
        self.shared.lock_state().order.values().cloned().collect()
    }

    pub fn is_precision_incompatible(&self, model_id: &str) -> bool {
        self.shared.lock_state().incompatible.contains(model_id)
    }

    fn lease(&self, model: Arc<ResidentModel>) -> ModelLease {
        ModelLease {
            model,
            shared: Arc::clone(&self.shared),
        }
    }
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("capacity", &self.capacity)
            .field("reduced_precision", &self.reduced_precision)
            .field("loaded", &self.loaded_model_ids())
            .finish()
    }
}

fn as_load_error(model_id: &str, err: UpscaleError) -> UpscaleError {
    match err {
        err @ (UpscaleError::NotFound { .. } | UpscaleError::LoadError { .. }) => err,
        other => UpscaleError::LoadError {
            model_id: model_id.to_string(),
            message: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Passthrough {
        precision: Precision,
    }

    impl Upsampler for Passthrough {
        fn scale(&self) -> u32 {
            1
        }

        fn precision(&self) -> Precision {
            self.precision
        }

        fn upsample(&mut self, tile: &Image) -> Result<Image> {
            Ok(tile.clone())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: Mutex<Vec<(String, Precision)>>,
        releases: AtomicUsize,
    }

    impl ModelLoader for CountingLoader {
        fn contains(&self, model_id: &str) -> bool {
            model_id != "missing"
        }

        fn load(&self, model_id: &str, precision: Precision) -> Result<Box<dyn Upsampler>> {
            if model_id == "broken" {
                return Err(UpscaleError::inference("bad weights"));
            }
            self.loads
                .lock()
                .unwrap()
                .push((model_id.to_string(), precision));
            // "half-only" models accept nothing but f16 input
            let precision = if model_id == "half-only" {
                Precision::Reduced
            } else {
                precision
            };
            Ok(Box::new(Passthrough { precision }))
        }

        fn release(&self, _model_id: &str) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn cache(capacity: usize, reduced: bool) -> (ModelCache, Arc<CountingLoader>) {
        let loader = Arc::new(CountingLoader::default());
        let cache = ModelCache::new(
            loader.clone(),
            Arc::new(ProgressSink::new()),
            capacity,
            reduced,
        )
        .unwrap();
        (cache, loader)
    }

    #[test]
    fn evicts_least_recently_used() {
        let (cache, _) = cache(2, false);
        drop(cache.get("A").unwrap());
        drop(cache.get("B").unwrap());
        drop(cache.get("C").unwrap());
        assert_eq!(cache.loaded_model_ids(), vec!["B", "C"]);
        assert!(!cache.is_loaded("A"));
    }

    #[test]
    fn access_refreshes_recency() {
        let (cache, loader) = cache(2, false);
        drop(cache.get("A").unwrap());
        drop(cache.get("B").unwrap());
        drop(cache.get("A").unwrap());
        drop(cache.get("C").unwrap());
        assert_eq!(cache.loaded_model_ids(), vec!["A", "C"]);
        assert_eq!(loader.loads.lock().unwrap().len(), 3);
    }

    #[test]
    fn leased_model_is_not_evicted() {
        let (cache, _) = cache(2, false);
        let a = cache.get("A").unwrap();
        drop(cache.get("B").unwrap());
        drop(cache.get("C").unwrap());
        assert!(cache.is_loaded("A"));
        assert!(!cache.is_loaded("B"));
        assert_eq!(a.id(), "A");
    }

    #[test]
    fn get_waits_for_a_returned_lease() {
        let (cache, _) = cache(1, false);
        let cache = Arc::new(cache);
        let a = cache.get("A").unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || cache.get("B").map(|lease| lease.id().to_string()))
        };
        std::thread::sleep(Duration::from_millis(100));
        assert!(!cache.is_loaded("B"));
        assert!(cache.is_loaded("A"));

        drop(a);
        let loaded = waiter.join().unwrap().unwrap();
        assert_eq!(loaded, "B");
        assert_eq!(cache.loaded_model_ids(), vec!["B"]);
    }

    #[test]
    fn second_reload_reuses_the_full_precision_copy() {
        let (cache, loader) = cache(1, true);
        let first = cache.get("A").unwrap();
        let second = cache.get("A").unwrap();
        assert_eq!(second.precision(), Precision::Reduced);

        drop(first);
        let reloaded = cache.mark_incompatible_and_reload("A").unwrap();
        drop(second);
        let again = cache.mark_incompatible_and_reload("A").unwrap();

        assert!(std::ptr::eq(&*reloaded, &*again));
        assert_eq!(again.precision(), Precision::Full);
        assert_eq!(cache.loaded_model_ids(), vec!["A"]);
        assert_eq!(
            *loader.loads.lock().unwrap(),
            vec![
                ("A".to_string(), Precision::Reduced),
                ("A".to_string(), Precision::Full),
            ]
        );
    }

    #[test]
    fn concurrent_fallbacks_load_full_precision_once() {
        let (cache, loader) = cache(1, true);
        let cache = Arc::new(cache);
        let leases: Vec<_> = (0..4).map(|_| cache.get("A").unwrap()).collect();

        std::thread::scope(|scope| {
            for lease in leases {
                let cache = Arc::clone(&cache);
                scope.spawn(move || {
                    drop(lease);
                    let lease = cache.mark_incompatible_and_reload("A").unwrap();
                    assert_eq!(lease.precision(), Precision::Full);
                });
            }
        });

        assert_eq!(loader.loads.lock().unwrap().len(), 2);
        assert_eq!(cache.loaded_model_ids(), vec!["A"]);
    }

    #[test]
    fn flagged_model_never_resides_in_reduced_precision() {
        let (cache, loader) = cache(2, true);
        let lease = cache.get("half-only").unwrap();
        assert_eq!(lease.precision(), Precision::Reduced);
        drop(lease);

        match cache.mark_incompatible_and_reload("half-only").unwrap_err() {
            UpscaleError::LoadError { model_id, message } => {
                assert_eq!(model_id, "half-only");
                assert!(message.contains("full precision"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!cache.is_loaded("half-only"));
        assert!(cache.is_precision_incompatible("half-only"));
        // the reduced copy and the rejected full load were both released
        assert_eq!(loader.releases.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn full_precision_cache_rejects_half_only_models() {
        let (cache, _) = cache(1, false);
        let err = cache.get("half-only").unwrap_err();
        assert!(matches!(err, UpscaleError::LoadError { .. }));
        assert!(cache.loaded_model_ids().is_empty());
    }

    #[test]
    fn reduced_mode_loads_half_precision_until_flagged() {
        let (cache, loader) = cache(3, true);
        let lease = cache.get("A").unwrap();
        assert_eq!(lease.precision(), Precision::Reduced);
        drop(lease);

        let lease = cache.mark_incompatible_and_reload("A").unwrap();
        assert_eq!(lease.precision(), Precision::Full);
        assert!(lease.is_precision_incompatible());
        assert!(cache.is_precision_incompatible("A"));
        drop(lease);

        cache.unload("A");
        let lease = cache.get("A").unwrap();
        assert_eq!(lease.precision(), Precision::Full);

        let loads = loader.loads.lock().unwrap().clone();
        assert_eq!(
            loads,
            vec![
                ("A".to_string(), Precision::Reduced),
                ("A".to_string(), Precision::Full),
                ("A".to_string(), Precision::Full),
            ]
        );
    }

    #[test]
    fn unload_of_leased_model_defers_release() {
        let (cache, loader) = cache(2, false);
        let lease = cache.get("A").unwrap();
        assert!(cache.unload("A"));
        assert!(!cache.is_loaded("A"));
        assert_eq!(loader.releases.load(Ordering::SeqCst), 0);

        let tile = Image::filled(2, 2, 0.5).unwrap();
        assert!(lease.upsample(&tile).is_ok());
        drop(lease);
        assert_eq!(loader.releases.load(Ordering::SeqCst), 1);
        assert!(!cache.unload("A"));
    }

    #[test]
    fn unload_all_clears_cache() {
        let (cache, loader) = cache(3, false);
        drop(cache.get("A").unwrap());
        drop(cache.get("B").unwrap());
        cache.unload_all();
        assert!(cache.loaded_model_ids().is_empty());
        assert_eq!(loader.releases.load(Ordering::SeqCst), 2);
        cache.unload_all();
    }

    #[test]
    fn unknown_model_is_not_found() {
        let (cache, _) = cache(1, false);
        drop(cache.get("A").unwrap());
        let err = cache.get("missing").unwrap_err();
        assert!(matches!(err, UpscaleError::NotFound { .. }));
        assert!(cache.is_loaded("A"));
    }

    #[test]
    fn loader_failures_become_load_errors() {
        let (cache, _) = cache(1, false);
        match cache.get("broken").unwrap_err() {
            UpscaleError::LoadError { model_id, message } => {
                assert_eq!(model_id, "broken");
                assert!(message.contains("bad weights"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.loaded_model_ids().is_empty());
    }

    #[test]
    fn emits_lifecycle_events() {
        let loader = Arc::new(CountingLoader::default());
        let progress = Arc::new(ProgressSink::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = Arc::clone(&events);
            progress.subscribe(move |event| events.lock().unwrap().push(event.clone()));
        }
        let cache = ModelCache::new(loader, progress, 1, false).unwrap();
        drop(cache.get("A").unwrap());
        drop(cache.get("A").unwrap());
        drop(cache.get("B").unwrap());

        let events = events.lock().unwrap();
        let kinds: Vec<_> = events
            .iter()
            .map(|event| match event {
                ProgressEvent::ModelLoading { model_id } => format!("loading:{model_id}"),
                ProgressEvent::ModelLoaded { model_id, .. } => format!("loaded:{model_id}"),
                ProgressEvent::ModelEvicted { model_id } => format!("evicted:{model_id}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(
            kinds,
            vec!["loading:A", "loaded:A", "evicted:A", "loading:B", "loaded:B"]
        );
    }

    #[test]
    fn zero_capacity_is_invalid() {
        let loader = Arc::new(CountingLoader::default());
        assert!(ModelCache::new(loader, Arc::new(ProgressSink::new()), 0, false).is_err());
    }
}
