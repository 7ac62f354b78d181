//! In-memory implementation of [`StateStore`], for tests and ephemeral runs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use crate::domain::{Job, JobResult};

use super::{Result, StateStore, StoreError};

/// HashMap-backed store. Records still round-trip through their serialized
/// form so the on-disk and in-memory stores exercise the same schema.
#[derive(Default)]
pub struct InMemoryStateStore {
    jobs: Mutex<HashMap<String, String>>,
    results: Mutex<HashMap<String, String>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for InMemoryStateStore {
    fn save_job(&self, job: &Job) -> Result<()> {
        let record = serde_json::to_string(job).map_err(StoreError::backend)?;
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.job_id.clone(), record);
        Ok(())
    }

    fn load_job(&self, job_id: &str) -> Result<Option<Job>> {
        let raw = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        raw.map(|record| {
            let job: Job = serde_json::from_str(&record).map_err(|e| StoreError::Corrupt {
                key: format!("job:{job_id}"),
                reason: e.to_string(),
            })?;
            job.validate().map_err(|e| StoreError::Corrupt {
                key: format!("job:{job_id}"),
                reason: e.to_string(),
            })?;
            Ok(job)
        })
        .transpose()
    }

    fn save_result(&self, result: &JobResult) -> Result<()> {
        let record = serde_json::to_string(result).map_err(StoreError::backend)?;
        let mut results = self.results.lock().unwrap_or_else(PoisonError::into_inner);
        if results.contains_key(&result.job_id) {
            return Err(StoreError::DuplicateResult(result.job_id.clone()));
        }
        results.insert(result.job_id.clone(), record);
        Ok(())
    }

    fn load_result(&self, job_id: &str) -> Result<Option<JobResult>> {
        let raw = self
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id)
            .cloned();
        raw.map(|record| {
            let result: JobResult =
                serde_json::from_str(&record).map_err(|e| StoreError::Corrupt {
                    key: format!("result:{job_id}"),
                    reason: e.to_string(),
                })?;
            result.validate().map_err(|e| StoreError::Corrupt {
                key: format!("result:{job_id}"),
                reason: e.to_string(),
            })?;
            Ok(result)
        })
        .transpose()
    }

    fn list_jobs(&self) -> Result<Vec<Job>> {
        let raw: Vec<(String, String)> = self
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(id, record)| (id.clone(), record.clone()))
            .collect();

        let mut jobs = Vec::new();
        for (job_id, record) in raw {
            let job: Job = serde_json::from_str(&record).map_err(|e| StoreError::Corrupt {
                key: format!("job:{job_id}"),
                reason: e.to_string(),
            })?;
            jobs.push(job);
        }
        jobs.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(jobs)
    }
}
