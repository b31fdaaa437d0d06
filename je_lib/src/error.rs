use std::io;

use je_data::{JobId, State, StreamKind};
use thiserror::Error;

use crate::util::ProcessExit;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Snapshot store unreachable or a save failed. The in-memory job keeps
    /// the mutated state.
    #[error("persistence error: {0}")]
    Persistence(#[source] io::Error),

    /// A stream could not be opened, nothing was started.
    #[error("could not open {kind} stream of job #{id}: {source}")]
    StreamStore {
        id: JobId,
        kind: StreamKind,
        #[source]
        source: io::Error,
    },

    /// Copying a stream failed after the process was started.
    #[error("{kind} stream of job #{id} truncated after {written} bytes ({exit}): {source}")]
    Truncated {
        id: JobId,
        kind: StreamKind,
        written: u64,
        exit: ProcessExit,
        #[source]
        source: io::Error,
    },

    #[error("process error for job #{id}: {source}")]
    Process {
        id: JobId,
        #[source]
        source: io::Error,
    },

    #[error("job #{0} has no attached process")]
    ProcessNotAttached(JobId),

    #[error("invalid operation on job #{id}: {msg}")]
    InvalidOperation { id: JobId, msg: String },

    /// Another caller already moved the job into a terminal state.
    #[error("job #{id} already terminated ({state})")]
    AlreadyTerminated { id: JobId, state: State },

    #[error("could not encode job #{id}: {source}")]
    Codec {
        id: JobId,
        #[source]
        source: serde_json::Error,
    },

    #[error("could not publish job #{id} on topic {topic}: {source}")]
    Bus {
        id: JobId,
        topic: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    pub(crate) fn invalid(id: JobId, msg: impl Into<String>) -> Self {
        Error::InvalidOperation {
            id,
            msg: msg.into(),
        }
    }

    /// True for spawn, signal and kill failures, including a missing process.
    pub fn is_process_error(&self) -> bool {
        matches!(self, Error::Process { .. } | Error::ProcessNotAttached(_))
    }
}
