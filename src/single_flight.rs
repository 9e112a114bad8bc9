//! Keyed request coalescing.
//!
//! Concurrent callers asking for the same key share one in-flight execution:
//! the first caller runs the work, everyone else awaits its result. Used by
//! the lazy sync path so a burst of requests for one repo name hits the code
//! host once.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

#[derive(Clone, Default)]
pub struct SingleFlight<T: Clone> {
    inflight: Arc<Mutex<HashMap<String, watch::Receiver<Option<T>>>>>,
}

impl<T: Clone + Send + Sync + 'static> SingleFlight<T> {
    pub fn new() -> Self {
        Self {
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `work` for `key`, unless an execution for the same key is already
    /// in flight, in which case await and return its result instead.
    pub async fn run<F, Fut>(&self, key: &str, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let tx = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(key) {
                Some(rx) => {
                    let mut rx = rx.clone();
                    drop(inflight);
                    // Clone out of the watch guard before matching; the
                    // guard is a non-Send read lock and must not be held
                    // across the awaits below.
                    let published = rx
                        .wait_for(|value| value.is_some())
                        .await
                        .map(|value| value.clone());
                    match published {
                        Ok(value) => return value.unwrap_or_else(|| unreachable!()),
                        Err(_) => {
                            // Leader dropped without publishing (it panicked).
                            // Clear the stale entry and run the work ourselves.
                            let mut inflight = self.inflight.lock().await;
                            if inflight
                                .get(key)
                                .is_some_and(|stale| stale.has_changed().is_err())
                            {
                                inflight.remove(key);
                            }
                            drop(inflight);
                            return Box::pin(self.run(key, work)).await;
                        }
                    }
                }
                None => {
                    let (tx, rx) = watch::channel(None);
                    inflight.insert(key.to_string(), rx);
                    tx
                }
            }
        };

        let value = work().await;

        let mut inflight = self.inflight.lock().await;
        inflight.remove(key);
        let _ = tx.send(Some(value.clone()));

        value
    }
}
