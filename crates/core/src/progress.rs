use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::types::Precision;

/// Progress notifications emitted by the engine and the runners built on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    ModelLoading {
        model_id: String,
    },
    ModelLoaded {
        model_id: String,
        scale: u32,
        precision: Precision,
    },
    ModelEvicted {
        model_id: String,
    },
    TileProgress {
        pass_num: u32,
        total_passes: u32,
        tiles_done: usize,
        tiles_total: usize,
    },
    TileSizeReduced {
        model_id: String,
        from: u32,
        to: u32,
    },
    PrecisionFallback {
        model_id: String,
    },
    ImageComplete {
        input: String,
        output: String,
        duration_seconds: f64,
    },
    ImageError {
        input: String,
        error: String,
    },
    BatchProgress {
        done: usize,
        total: usize,
        current: String,
    },
    ComparisonModelStart {
        model_id: String,
        index: usize,
        total: usize,
    },
    ComparisonModelDone {
        model_id: String,
        success: bool,
        duration_seconds: f64,
    },
}

pub type ProgressCallback = dyn Fn(&ProgressEvent) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Synchronous fan-out of [`ProgressEvent`]s to any number of subscribers.
///
/// A subscriber that panics is logged and skipped; the remaining subscribers
/// still receive the event.
#[derive(Default)]
pub struct ProgressSink {
    subscribers: RwLock<Vec<(SubscriptionId, Arc<ProgressCallback>)>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressSink")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl ProgressSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        subscribers.push((id, Arc::new(callback)));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self
            .subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn emit(&self, event: ProgressEvent) {
        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let subscribers: Vec<_> = self
            .subscribers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();

        for callback in subscribers {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| callback(&event))) {
                error!(
                    event = ?event,
                    panic = panic_message(panic.as_ref()),
                    "Progress subscriber panicked"
                );
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "non-string panic payload"
    }
}
