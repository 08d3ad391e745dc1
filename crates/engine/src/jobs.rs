//! Table of in-flight engine jobs, one per engine key.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::job::EngineJob;
use crate::key::EngineKey;

#[derive(Default)]
struct Tables {
    jobs: HashMap<EngineKey, Arc<EngineJob>>,
    /// Jobs that may only read from the disk cache; they can't serve regular loads.
    only_cache_jobs: HashMap<EngineKey, Arc<EngineJob>>,
}

impl Tables {
    fn table(&mut self, only_retrieve_from_cache: bool) -> &mut HashMap<EngineKey, Arc<EngineJob>> {
        if only_retrieve_from_cache {
            &mut self.only_cache_jobs
        } else {
            &mut self.jobs
        }
    }
}

#[derive(Default)]
pub(crate) struct Jobs {
    tables: Mutex<Tables>,
}

impl Jobs {
    pub(crate) fn get(&self, key: &EngineKey, only_retrieve_from_cache: bool) -> Option<Arc<EngineJob>> {
        self.tables
            .lock()
            .unwrap()
            .table(only_retrieve_from_cache)
            .get(key)
            .cloned()
    }

    /// Register `job` for its key, returning the job it replaced.
    pub(crate) fn insert(&self, job: Arc<EngineJob>) -> Option<Arc<EngineJob>> {
        let mut tables = self.tables.lock().unwrap();
        tables
            .table(job.only_retrieve_from_cache())
            .insert(job.key().clone(), job)
    }

    /// Remove the entry for the job's key, but only if it is still this job.
    pub(crate) fn remove_if_current(&self, job: &Arc<EngineJob>) -> bool {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.table(job.only_retrieve_from_cache());
        match table.get(job.key()) {
            Some(current) if Arc::ptr_eq(current, job) => {
                table.remove(job.key());
                true
            }
            _ => false,
        }
    }

    pub(crate) fn len(&self) -> usize {
        let tables = self.tables.lock().unwrap();
        tables.jobs.len() + tables.only_cache_jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{EngineJobListener, JobFlags};
    use crate::resource::tests::test_key;
    use crate::resource::{EngineResource, ResourceListener};
    use pixelflow_scheduler::EnginePools;
    use std::sync::Weak;

    struct NoopListener;

    impl EngineJobListener for NoopListener {
        fn on_engine_job_complete(
            &self,
            _job: &Arc<EngineJob>,
            _key: &EngineKey,
            _resource: Option<&EngineResource>,
        ) {
        }

        fn on_engine_job_cancelled(&self, _job: &Arc<EngineJob>, _key: &EngineKey) {}
    }

    impl ResourceListener for NoopListener {
        fn on_resource_released(&self, _key: &EngineKey, _resource: EngineResource) {}
    }

    fn job(model: &str, only_retrieve_from_cache: bool) -> Arc<EngineJob> {
        let listener: Weak<NoopListener> = Weak::new();
        let job_listener: Weak<dyn EngineJobListener> = listener.clone();
        let resource_listener: Weak<dyn ResourceListener> = listener;
        EngineJob::new(
            test_key(model),
            JobFlags {
                only_retrieve_from_cache,
                ..JobFlags::default()
            },
            Arc::new(EnginePools::direct()),
            job_listener,
            resource_listener,
        )
    }

    #[test]
    fn test_insert_replaces_previous_job() {
        let jobs = Jobs::default();
        let first = job("a", false);
        let second = job("a", false);

        assert!(jobs.insert(first.clone()).is_none());
        let replaced = jobs.insert(second.clone()).unwrap();
        assert!(Arc::ptr_eq(&replaced, &first));
        assert!(Arc::ptr_eq(&jobs.get(&test_key("a"), false).unwrap(), &second));
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn test_only_cache_jobs_are_separate() {
        let jobs = Jobs::default();
        assert!(jobs.insert(job("a", false)).is_none());
        assert!(jobs.insert(job("a", true)).is_none());

        assert_eq!(jobs.len(), 2);
        assert!(!Arc::ptr_eq(
            &jobs.get(&test_key("a"), false).unwrap(),
            &jobs.get(&test_key("a"), true).unwrap()
        ));
    }

    #[test]
    fn test_remove_checks_identity() {
        let jobs = Jobs::default();
        let current = job("a", false);
        let stale = job("a", false);
        jobs.insert(current.clone());

        assert!(!jobs.remove_if_current(&stale));
        assert_eq!(jobs.len(), 1);
        assert!(jobs.remove_if_current(&current));
        assert!(jobs.get(&test_key("a"), false).is_none());
        assert!(!jobs.remove_if_current(&current));
    }
}
