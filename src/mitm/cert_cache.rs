//! Certificate Cache
//!
//! Leaf certificates are cached by primary hostname for the lifetime of the
//! authority. Each hostname owns a `OnceCell`, so concurrent first contact
//! from several sessions results in exactly one issuance: the first caller
//! runs the issuer, the others await its result. A failed issuance leaves the
//! cell empty and the next caller tries again.

use crate::mitm::certificate_authority::LeafCertificateRecord;
use crate::mitm::error::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

type Slot = Arc<OnceCell<Arc<LeafCertificateRecord>>>;

/// Per-host leaf cache with a per-host issuance lock
#[derive(Default)]
pub struct LeafCache {
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LeafCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached leaf for `hostname`, running `issue` on first contact
    pub async fn get_or_issue<F, Fut>(
        &self,
        hostname: &str,
        issue: F,
    ) -> Result<Arc<LeafCertificateRecord>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<LeafCertificateRecord>>,
    {
        let key = hostname.to_ascii_lowercase();
        let slot = {
            let mut slots = self.slots.lock().await;
            Arc::clone(slots.entry(key).or_default())
        };

        if let Some(record) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(hostname = %hostname, "Leaf certificate cache hit");
            return Ok(Arc::clone(record));
        }

        let mut ran_issuer = false;
        let record = slot
            .get_or_try_init(|| {
                ran_issuer = true;
                let pending = issue();
                async move { pending.await.map(Arc::new) }
            })
            .await?;

        if ran_issuer {
            self.misses.fetch_add(1, Ordering::Relaxed);
        } else {
            // Another session finished issuing while we waited.
            self.hits.fetch_add(1, Ordering::Relaxed);
        }

        Ok(Arc::clone(record))
    }

    /// Number of hostnames with an issued leaf
    pub async fn len(&self) -> usize {
        let slots = self.slots.lock().await;
        slots.values().filter(|slot| slot.initialized()).count()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
