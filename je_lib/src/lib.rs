//! Job execution engine: runs submitted commands as tracked jobs, captures
//! their streams into a [`DataStore`] and persists every state transition
//! through a [`JobStore`].

pub mod completion;
pub mod error;
pub mod job;
pub mod job_pool;
pub mod queue;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;

pub use je_data::{JobId, JobSnapshot, JobSpec, State, StreamKind};

pub use crate::{
    error::{Error, Result},
    job::Job,
    job_pool::JobPool,
    queue::{MessageBus, MessageBusQueue},
    store::{DataStore, FsDataStore, FsJobStore, JobStore, MemoryDataStore, MemoryJobStore},
    util::ProcessExit,
};
