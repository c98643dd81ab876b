//! Registry of provider kinds the controller is subscribed to.
//!
//! A watch is installed the first time a kind is referenced by any machine
//! and stays installed for the lifetime of the process. The installer decides
//! the key a watch covers; by default that is the provider kind. Concurrent callers for
//! the same kind wait on a single install; unrelated kinds never contend
//! beyond a brief map lookup.

use crate::error::ControllerError;
use async_trait::async_trait;
use crds::ObjectReference;
use prometheus::IntGauge;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::info;

/// Installs a change subscription for one provider kind.
#[async_trait]
pub trait WatchInstaller: Send + Sync {
    /// Start watching the kind of `reference`. Called at most once per
    /// watch key unless a previous attempt failed.
    async fn install(&self, reference: &ObjectReference) -> Result<(), ControllerError>;

    /// Key of the watch that covers `reference`.
    fn watch_key(&self, reference: &ObjectReference) -> String {
        reference.kind_key()
    }
}

/// Process-wide set of watched provider kinds, keyed by `WatchInstaller::watch_key`.
pub struct WatchRegistry {
    installer: Arc<dyn WatchInstaller>,
    kinds: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    gauge: Option<IntGauge>,
}

impl std::fmt::Debug for WatchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchRegistry")
            .field("watched_kinds", &self.watched_kinds())
            .finish_non_exhaustive()
    }
}

impl WatchRegistry {
    /// Create an empty registry backed by `installer`.
    pub fn new(installer: Arc<dyn WatchInstaller>) -> Self {
        Self {
            installer,
            kinds: Mutex::new(HashMap::new()),
            gauge: None,
        }
    }

    /// Report the number of watched kinds on `gauge`.
    #[must_use]
    pub fn with_gauge(mut self, gauge: IntGauge) -> Self {
        self.gauge = Some(gauge);
        self
    }

    /// Make sure the kind of `reference` is watched.
    ///
    /// Returns `true` if this call performed the install. A failed install
    /// leaves the kind unwatched so the next caller retries it.
    ///
    /// # Errors
    ///
    /// Returns the installer's error when the install fails.
    pub async fn ensure_watch(&self, reference: &ObjectReference) -> Result<bool, ControllerError> {
        let key = self.installer.watch_key(reference);
        let cell = {
            let mut kinds = self.kinds.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(kinds.entry(key.clone()).or_default())
        };
        if cell.initialized() {
            return Ok(false);
        }

        let installed = AtomicBool::new(false);
        cell.get_or_try_init(|| async {
            self.installer.install(reference).await?;
            installed.store(true, Ordering::SeqCst);
            Ok::<(), ControllerError>(())
        })
        .await?;

        let installed = installed.load(Ordering::SeqCst);
        if installed {
            info!("Watching provider {}", key);
            if let Some(gauge) = &self.gauge {
                gauge.set(i64::try_from(self.watched_kinds()).unwrap_or(i64::MAX));
            }
        }
        Ok(installed)
    }

    /// Whether the kind of `reference` is already watched.
    #[cfg(test)]
    pub fn is_watched(&self, reference: &ObjectReference) -> bool {
        self.kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.installer.watch_key(reference))
            .is_some_and(|cell| cell.initialized())
    }

    /// Number of kinds with an installed watch.
    pub fn watched_kinds(&self) -> usize {
        self.kinds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|cell| cell.initialized())
            .count()
    }
}
