use std::{collections::HashMap, sync::Arc};

use je_data::{JobId, JobSpec, State};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::{
    error::{Error, Result},
    job::Job,
    store::{DataStore, JobStore},
    util::ProcessExit,
};

/// Creates jobs against the injected stores and keeps them addressable by id.
///
/// Jobs stay registered after they terminate so their state can still be
/// looked up. Dropping them is up to the owner, one at a time through
/// [`delete`](JobPool::delete) or all finished ones through [`prune`](JobPool::prune).
pub struct JobPool {
    store: Arc<dyn JobStore>,
    data: Arc<dyn DataStore>,
    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
}

impl JobPool {
    pub fn new(store: Arc<dyn JobStore>, data: Arc<dyn DataStore>) -> Self {
        Self {
            store,
            data,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// create a job in `UNSCHEDULED` state and register it
    #[instrument(skip(self))]
    pub async fn create(&self, spec: JobSpec) -> Result<Arc<Job>> {
        let job = Arc::new(Job::create(spec, self.store.clone(), self.data.clone()).await?);
        self.jobs.lock().await.insert(job.id(), job.clone());
        Ok(job)
    }

    /// create a job and enqueue it right away
    pub async fn submit(&self, spec: JobSpec) -> Result<Arc<Job>> {
        let job = self.create(spec).await?;
        job.enqueue().await?;
        Ok(job)
    }

    pub async fn get(&self, id: JobId) -> Option<Arc<Job>> {
        self.jobs.lock().await.get(&id).cloned()
    }

    /// get a mapping of all live jobs and their specs
    pub async fn list(&self) -> HashMap<JobId, JobSpec> {
        let jobs: Vec<Arc<Job>> = self.jobs.lock().await.values().cloned().collect();
        let mut specs = HashMap::new();
        for job in jobs {
            specs.insert(job.id(), job.snapshot().await.spec());
        }
        specs
    }

    /// drops a job from the pool, killing its process if it is still running
    /// returns false if the job is unknown
    #[instrument(skip(self))]
    pub async fn delete(&self, id: JobId) -> Result<bool> {
        let job = match self.jobs.lock().await.remove(&id) {
            Some(job) => job,
            None => return Ok(false),
        };
        if job.state().await == State::Running {
            match job.kill(true).await {
                Ok(()) | Err(Error::ProcessNotAttached(_)) | Err(Error::AlreadyTerminated { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        info!("deleted job");
        Ok(true)
    }

    /// drops every job that reached a terminal state, returns how many were dropped
    #[instrument(skip(self))]
    pub async fn prune(&self) -> usize {
        let jobs: Vec<Arc<Job>> = self.jobs.lock().await.values().cloned().collect();
        let mut finished = Vec::new();
        for job in jobs {
            if job.state().await.is_terminal() {
                finished.push(job.id());
            }
        }
        let mut jobs = self.jobs.lock().await;
        for id in &finished {
            jobs.remove(id);
        }
        info!("pruned {} finished jobs", finished.len());
        finished.len()
    }

    /// Runs a waiting job on `worker` and finalizes its state in this context:
    /// a normal exit stops the job, a setup failure or an exit by a signal
    /// nobody asked for marks it errored, a forced kill is left as `KILLED`.
    #[instrument(skip(self, job), fields(id = %job.id()))]
    pub async fn run(&self, job: &Job, worker: &str) -> Result<ProcessExit> {
        job.start(worker).await?;
        match job.execute().await {
            Ok(exit @ ProcessExit::Code(_)) => {
                finalize(job.stop().await)?;
                Ok(exit)
            }
            Ok(exit @ ProcessExit::Signal(_)) => {
                let cause = std::io::Error::other(format!("process {}", exit));
                finalize(job.error(&cause).await)?;
                Ok(exit)
            }
            Err(err) => {
                // a truncated capture still saw the process exit normally
                let exited = matches!(
                    err,
                    Error::Truncated {
                        exit: ProcessExit::Code(_),
                        ..
                    }
                );
                if exited {
                    finalize(job.stop().await)?;
                } else {
                    finalize(job.error(&err).await)?;
                }
                Err(err)
            }
        }
    }
}

// a concurrent kill may already have finalized the job
fn finalize(result: Result<()>) -> Result<()> {
    match result {
        Err(Error::AlreadyTerminated { id, state }) => {
            warn!("job #{} was already finalized as {}", id, state);
            Ok(())
        }
        result => result,
    }
}
