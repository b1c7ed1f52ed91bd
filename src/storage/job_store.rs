use crate::optimize::model::{now_ms, JobPatch, JobRecord, JobState};
use crate::storage::connection::establish_connection;
use crate::storage::repository::JobRepository;
use crate::storage::StoreError;
use log::{error, info};
use sea_orm::DatabaseConnection;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

/// Durable job records with an in-memory cache.
///
/// The cache is loaded from the database on first access. Every mutation
/// holds the cache lock across its database write, so two concurrent
/// `update` calls on the same job apply one after the other. A failed write
/// leaves the attempted mutation in the cache; the error tells the caller the
/// record may not be durable yet, and `forget` lets it take the record back.
pub struct JobStore {
    db: Arc<DatabaseConnection>,
    cache: Mutex<Option<HashMap<String, JobRecord>>>,
}

impl JobStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self {
            db,
            cache: Mutex::new(None),
        }
    }

    pub async fn open(db_url: &str) -> Result<Self, StoreError> {
        let db = establish_connection(db_url).await?;
        Ok(Self::new(Arc::new(db)))
    }

    pub fn db(&self) -> &Arc<DatabaseConnection> {
        &self.db
    }

    async fn loaded(&self) -> Result<MappedMutexGuard<'_, HashMap<String, JobRecord>>, StoreError> {
        let mut guard = self.cache.lock().await;
        if guard.is_none() {
            let records = JobRepository::load_all(&self.db).await?;
            info!("✓ job store loaded {} records", records.len());
            *guard = Some(records.into_iter().map(|r| (r.id.clone(), r)).collect());
        }
        Ok(MutexGuard::map(guard, |cache| {
            cache.get_or_insert_with(HashMap::new)
        }))
    }

    /// Stores `record` as given, replacing any previous version.
    pub async fn put(&self, record: JobRecord) -> Result<(), StoreError> {
        let mut cache = self.loaded().await?;
        cache.insert(record.id.clone(), record.clone());
        if let Err(e) = JobRepository::upsert(&self.db, &record).await {
            error!("✗ failed to persist job {}: {}", record.id, e);
            return Err(e);
        }
        Ok(())
    }

    /// Merges `patch` over the stored record and rewrites it.
    ///
    /// State changes must follow the job lifecycle; anything leaving a
    /// terminal state is rejected with `IllegalTransition` and nothing is
    /// written.
    pub async fn update(&self, id: &str, patch: JobPatch) -> Result<JobRecord, StoreError> {
        let mut cache = self.loaded().await?;
        let current = cache
            .get(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let mut next = current.clone();
        if let Some(state) = patch.state {
            if !current.state.can_transition_to(state) {
                return Err(StoreError::IllegalTransition {
                    id: id.to_string(),
                    from: current.state,
                    to: state,
                });
            }
            next.state = state;
        }
        if patch.output.is_some() {
            next.output = patch.output;
        }
        if patch.error.is_some() {
            next.error = patch.error;
        }
        next.updated_at = now_ms().max(next.updated_at);

        cache.insert(id.to_string(), next.clone());
        if let Err(e) = JobRepository::upsert(&self.db, &next).await {
            error!("✗ failed to persist update of job {}: {}", id, e);
            return Err(e);
        }
        Ok(next)
    }

    /// Drops `id` from the cache only. The database is not touched.
    pub async fn forget(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.loaded().await?.remove(id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.loaded().await?.get(id).cloned())
    }

    pub async fn contains(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.loaded().await?.contains_key(id))
    }

    /// All records, oldest first.
    pub async fn list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let cache = self.loaded().await?;
        let mut records: Vec<JobRecord> = cache.values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(records)
    }

    pub async fn list_by_state(&self, state: JobState) -> Result<Vec<JobRecord>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.state == state)
            .collect())
    }

    /// Records persisted as `running`: work interrupted by the last shutdown.
    /// Deciding what to do with them is up to the caller.
    pub async fn resume_candidates(&self) -> Result<Vec<JobRecord>, StoreError> {
        self.list_by_state(JobState::Running).await
    }

    /// Deletes terminal records whose `updated_at` is more than `max_age_ms`
    /// in the past and returns how many were removed. The database is not
    /// touched when nothing qualifies.
    pub async fn cleanup(&self, max_age_ms: i64) -> Result<usize, StoreError> {
        let mut cache = self.loaded().await?;
        let now = now_ms();
        let expired: Vec<String> = cache
            .values()
            .filter(|r| {
                r.state.is_terminal() && now.saturating_sub(r.updated_at) > max_age_ms
            })
            .map(|r| r.id.clone())
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        JobRepository::delete_many(&self.db, &expired).await?;
        for id in &expired {
            cache.remove(id);
        }
        info!("✓ cleanup removed {} expired jobs", expired.len());
        Ok(expired.len())
    }
}
