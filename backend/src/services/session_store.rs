use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::api::middleware::AppError;
use crate::models::{TableSchema, UploadedDataset};
use crate::storage::StoreHandle;

/// A registered dataset and its backing store
#[derive(Debug)]
pub struct Dataset {
    pub metadata: UploadedDataset,
    pub store: StoreHandle,
}

impl Dataset {
    pub fn id(&self) -> &str {
        &self.metadata.id
    }

    pub fn schema(&self) -> &TableSchema {
        &self.metadata.schema
    }
}

/// A converted dataset waiting to be registered
#[derive(Debug)]
pub struct NewDataset {
    pub id: String,
    pub filename: String,
    pub byte_size: u64,
    pub encoding: String,
    pub delimiter: char,
    pub schema: TableSchema,
    pub store: StoreHandle,
}

/// Registry of live datasets. Entries expire `ttl` after registration and
/// are dropped lazily on lookup or by the periodic sweep.
pub struct SessionStore {
    entries: Arc<RwLock<HashMap<String, Arc<Dataset>>>>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(RwLock::new(HashMap::new())),
            ttl,
        }
    }

    /// Mint a fresh dataset id
    pub fn allocate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// Publish a converted dataset. The entry becomes visible to `get` in one
    /// step, with `expires_at` set from the store's TTL.
    pub async fn register(&self, dataset: NewDataset) -> Result<Arc<Dataset>, AppError> {
        let created_at = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl)
            .map_err(|e| AppError::Internal(format!("Invalid session TTL: {}", e)))?;
        let expires_at = created_at
            .checked_add_signed(ttl)
            .ok_or_else(|| AppError::Internal("Session TTL overflows the calendar".to_string()))?;

        let entry = Arc::new(Dataset {
            metadata: UploadedDataset {
                id: dataset.id,
                filename: dataset.filename,
                byte_size: dataset.byte_size,
                encoding: dataset.encoding,
                delimiter: dataset.delimiter,
                created_at,
                expires_at,
                schema: dataset.schema,
            },
            store: dataset.store,
        });

        let mut entries = self.entries.write().await;
        if entries.contains_key(entry.id()) {
            return Err(AppError::Internal(format!("Dataset {} is already registered", entry.id())));
        }
        entries.insert(entry.id().to_string(), entry.clone());
        drop(entries);

        tracing::info!(
            "Registered dataset {} ({} rows, expires {})",
            entry.id(),
            entry.schema().row_count,
            expires_at
        );
        Ok(entry)
    }

    /// Look up a live dataset. Expired entries are reported as missing even
    /// before the sweeper has removed them.
    pub async fn get(&self, id: &str) -> Result<Arc<Dataset>, AppError> {
        let entries = self.entries.read().await;
        match entries.get(id) {
            Some(dataset) if !dataset.metadata.is_expired_at(Utc::now()) => Ok(dataset.clone()),
            Some(_) => {
                tracing::debug!("Dataset {} has expired", id);
                Err(not_found(id))
            }
            None => Err(not_found(id)),
        }
    }

    /// Remove a dataset and delete its store
    pub async fn remove(&self, id: &str) -> Result<(), AppError> {
        let removed = self.entries.write().await.remove(id);
        let dataset = removed.ok_or_else(|| not_found(id))?;

        release(&dataset);
        tracing::info!("Removed dataset {}", id);
        Ok(())
    }

    /// Drop every expired entry and delete its store. Returns the number
    /// removed; a second call right after removes nothing.
    pub async fn sweep_expired(&self) -> usize {
        let now = Utc::now();

        let expired: Vec<String> = {
            let entries = self.entries.read().await;
            entries
                .values()
                .filter(|d| d.metadata.is_expired_at(now))
                .map(|d| d.id().to_string())
                .collect()
        };
        if expired.is_empty() {
            return 0;
        }

        let mut removed: Vec<Arc<Dataset>> = Vec::with_capacity(expired.len());
        {
            let mut entries = self.entries.write().await;
            for id in &expired {
                // Another task may have removed it since the read pass
                let still_expired = entries
                    .get(id.as_str())
                    .is_some_and(|d| d.metadata.is_expired_at(now));
                if still_expired {
                    if let Some(dataset) = entries.remove(id.as_str()) {
                        removed.push(dataset);
                    }
                }
            }
        }

        for dataset in &removed {
            release(dataset);
        }

        if !removed.is_empty() {
            tracing::info!("Swept {} expired datasets", removed.len());
        }
        removed.len()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn not_found(id: &str) -> AppError {
    AppError::NotFound(format!("Dataset {} not found or expired", id))
}

fn release(dataset: &Dataset) {
    if let Err(e) = dataset.store.release() {
        tracing::warn!(
            "Failed to delete store {} for dataset {}: {}",
            dataset.store.path().display(),
            dataset.id(),
            e
        );
    }
}

/// Run `sweep_expired` on a fixed interval until the runtime shuts down
pub fn spawn_sweeper(store: Arc<SessionStore>, every: Duration) -> JoinHandle<()> {
    let every = if every.is_zero() {
        tracing::warn!("Sweep interval is zero, using default of 60 seconds");
        Duration::from_secs(60)
    } else {
        every
    };

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            let removed = store.sweep_expired().await;
            tracing::debug!("Session sweep finished, {} datasets removed", removed);
        }
    })
}
