use std::{
    fmt,
    process::Stdio,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use chrono::Utc;
use je_data::{JobId, JobSnapshot, JobSpec, State, StreamKind};
use tokio::{
    io::{self, AsyncRead, AsyncWriteExt},
    process::{ChildStdin, Command},
    sync::{mpsc, oneshot, watch, Mutex, RwLock},
    task::JoinHandle,
};
use tracing::{error, info, instrument, warn};

use crate::{
    completion::Completion,
    error::{Error, Result},
    store::{ByteReader, ByteWriter, DataStore, JobStore},
    util::{drain, feed_input, manage_process, DrainReport, KillRequest, KillSignal, ProcessExit},
};

enum Input {
    /// stdin is fed from the job's stored `input` stream
    Stored,
    /// stdin is written by callers through [`Job::write`] while attached
    Interactive { attached: Option<Arc<AttachedInput>> },
}

/// Live stdin of an interactive process. Writers hold `stdin` for the
/// length of a copy; detaching cancels them.
struct AttachedInput {
    stdin: Mutex<Option<ChildStdin>>,
    detached: watch::Sender<bool>,
}

impl AttachedInput {
    fn new(stdin: ChildStdin) -> Self {
        Self {
            stdin: Mutex::new(Some(stdin)),
            detached: watch::channel(false).0,
        }
    }

    fn detach(&self) {
        self.detached.send_replace(true);
    }
}

struct ProcessHandle {
    kill_tx: mpsc::Sender<KillRequest>,
}

/// A tracked command execution.
///
/// Persisted fields live in `record` and are saved after every transition.
/// The process and interactive input handles never leave the job; they are
/// only present while [`Job::execute`] runs.
pub struct Job {
    id: JobId,
    record: Mutex<JobSnapshot>,
    process: RwLock<Option<ProcessHandle>>,
    input: Mutex<Input>,
    executed: AtomicBool,
    completion: Completion,
    store: Arc<dyn JobStore>,
    data: Arc<dyn DataStore>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job").field("id", &self.id).finish()
    }
}

impl Job {
    /// Allocates an id, saves the initial `UNSCHEDULED` snapshot and returns the job.
    pub async fn create(
        spec: JobSpec,
        store: Arc<dyn JobStore>,
        data: Arc<dyn DataStore>,
    ) -> Result<Self> {
        let id = store.next_id().await.map_err(Error::Persistence)?;
        let input = if spec.interactive {
            Input::Interactive { attached: None }
        } else {
            Input::Stored
        };
        let snapshot = JobSnapshot::new(id, spec);
        store.save(&snapshot).await.map_err(Error::Persistence)?;
        info!("created job #{} ({})", id, snapshot.name);
        Ok(Self {
            id,
            record: Mutex::new(snapshot),
            process: RwLock::new(None),
            input: Mutex::new(input),
            executed: AtomicBool::new(false),
            completion: Completion::new(),
            store,
            data,
        })
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub async fn snapshot(&self) -> JobSnapshot {
        self.record.lock().await.clone()
    }

    pub async fn state(&self) -> State {
        self.record.lock().await.state
    }

    /// Exit code of the process, only trustworthy once the job is `STOPPED`.
    pub async fn status(&self) -> i32 {
        self.record.lock().await.status
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn enqueue(&self) -> Result<()> {
        let mut record = self.record.lock().await;
        if record.state != State::Unscheduled {
            return Err(Error::invalid(
                self.id,
                format!("cannot enqueue a job in state {}", record.state),
            ));
        }
        record.state = State::Waiting;
        info!("job enqueued");
        self.save(&record).await
    }

    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn start(&self, worker: &str) -> Result<()> {
        let mut record = self.record.lock().await;
        if record.state != State::Waiting {
            return Err(Error::invalid(
                self.id,
                format!("cannot start a job in state {}", record.state),
            ));
        }
        record.worker = worker.to_string();
        record.state = State::Running;
        record.started_at = Some(Utc::now());
        info!("job started");
        self.save(&record).await
    }

    /// Marks a running job as stopped after its process exited on its own.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn stop(&self) -> Result<()> {
        let mut record = self.record.lock().await;
        self.claim_termination(record.state)?;
        record.state = State::Stopped;
        record.stopped_at = Some(Utc::now());
        self.completion.fire();
        info!("job stopped with status {}", record.status);
        self.save(&record).await
    }

    /// With `force` the process is killed and the job becomes `KILLED`.
    /// Without it the process only receives an interrupt; the state is left
    /// alone until the caller finalizes the job once the process has exited.
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn kill(&self, force: bool) -> Result<()> {
        let kill_tx = match &*self.process.read().await {
            Some(handle) => handle.kill_tx.clone(),
            None => return Err(Error::ProcessNotAttached(self.id)),
        };

        if !force {
            return request_kill(kill_tx, KillSignal::Interrupt)
                .await
                .map_err(|source| Error::Process {
                    id: self.id,
                    source,
                });
        }

        let mut record = self.record.lock().await;
        self.claim_termination(record.state)?;
        if let Err(source) = request_kill(kill_tx, KillSignal::Kill).await {
            self.completion.release();
            error!("error killing job #{}: {}", self.id, source);
            return Err(Error::Process {
                id: self.id,
                source,
            });
        }
        record.state = State::Killed;
        record.killed_at = Some(Utc::now());
        self.completion.fire();
        info!("job killed");
        self.save(&record).await
    }

    /// Moves the job to `ERRORED` from any state that is not already terminal.
    #[instrument(skip(self, cause), fields(id = %self.id))]
    pub async fn error(&self, cause: &(dyn std::error::Error + Send + Sync)) -> Result<()> {
        let mut record = self.record.lock().await;
        if record.state.is_terminal() || !self.completion.claim() {
            return Err(Error::AlreadyTerminated {
                id: self.id,
                state: record.state,
            });
        }
        record.state = State::Errored;
        record.errored_at = Some(Utc::now());
        self.completion.fire();
        error!("job errored: {}", cause);
        self.save(&record).await
    }

    /// Resolves once the job reached `STOPPED`, `KILLED` or `ERRORED`.
    pub async fn wait(&self) {
        self.completion.wait().await
    }

    /// Copies `input` into the stdin of a running interactive process.
    /// Fails if the job is not interactive or its input is not attached
    /// (execution not started yet, input closed or process exited).
    /// A copy still pending when the input is closed or the process exits
    /// is abandoned with `InvalidOperation`.
    pub async fn write<R>(&self, input: &mut R) -> Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let attached = self.attached_input("write to").await?;
        let mut detached = attached.detached.subscribe();
        let copy = async {
            let mut stdin = attached.stdin.lock().await;
            let writer = stdin
                .as_mut()
                .ok_or_else(|| Error::invalid(self.id, "input is not attached"))?;
            let written = io::copy(input, writer).await.map_err(|source| Error::Process {
                id: self.id,
                source,
            })?;
            writer.flush().await.map_err(|source| Error::Process {
                id: self.id,
                source,
            })?;
            Ok::<_, Error>(written)
        };
        tokio::select! {
            result = copy => result,
            _ = detached.wait_for(|detached| *detached) => {
                warn!("input of job #{} detached during a write", self.id);
                Err(Error::invalid(self.id, "input was detached while writing"))
            }
        }
    }

    /// Closes the stdin of a running interactive process, abandoning a pending write.
    pub async fn close(&self) -> Result<()> {
        let attached = match &mut *self.input.lock().await {
            Input::Stored => {
                return Err(Error::invalid(self.id, "cannot close a non-interactive job"))
            }
            Input::Interactive { attached } => attached
                .take()
                .ok_or_else(|| Error::invalid(self.id, "input is not attached"))?,
        };
        attached.detach();
        let stdin = attached.stdin.lock().await.take();
        let mut writer = match stdin {
            Some(writer) => writer,
            None => return Ok(()),
        };
        match writer.shutdown().await {
            Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(Error::Process {
                id: self.id,
                source: err,
            }),
            _ => Ok(()),
        }
    }

    // the slot lock only covers the lookup, never a copy
    async fn attached_input(&self, action: &str) -> Result<Arc<AttachedInput>> {
        match &*self.input.lock().await {
            Input::Stored => Err(Error::invalid(
                self.id,
                format!("cannot {} a non-interactive job", action),
            )),
            Input::Interactive { attached: None } => {
                Err(Error::invalid(self.id, "input is not attached"))
            }
            Input::Interactive {
                attached: Some(attached),
            } => Ok(attached.clone()),
        }
    }

    /// Runs the job's command to completion and records its exit code.
    ///
    /// Streams are opened before anything is spawned, so a stream store
    /// failure leaves no process behind. A non-zero exit is a normal return.
    /// The job's state is not changed; the caller finalizes it with
    /// [`stop`](Job::stop), [`kill`](Job::kill) or [`error`](Job::error).
    #[instrument(skip(self), fields(id = %self.id))]
    pub async fn execute(&self) -> Result<ProcessExit> {
        let (name, args) = {
            let record = self.record.lock().await;
            if record.state != State::Running {
                return Err(Error::invalid(
                    self.id,
                    format!("cannot execute a job in state {}", record.state),
                ));
            }
            (record.name.clone(), record.args.clone())
        };
        if self.executed.swap(true, Ordering::AcqRel) {
            return Err(Error::invalid(self.id, "job has already been executed"));
        }

        let interactive = matches!(&*self.input.lock().await, Input::Interactive { .. });
        let stored_input = if interactive {
            None
        } else {
            Some(self.open_read(StreamKind::Input).await?)
        };
        let logs = self.open_write(StreamKind::Logs).await?;
        let output = self.open_write(StreamKind::Output).await?;

        let mut process = Command::new(&name)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                error!("error starting job #{}: {}", self.id, source);
                Error::Process {
                    id: self.id,
                    source,
                }
            })?;
        info!("process spawned, pid: {:?}", process.id());

        let (stdin, stdout, stderr) = match (
            process.stdin.take(),
            process.stdout.take(),
            process.stderr.take(),
        ) {
            (Some(stdin), Some(stdout), Some(stderr)) => (stdin, stdout, stderr),
            _ => {
                return Err(Error::Process {
                    id: self.id,
                    source: io::Error::other("process pipes were not created"),
                })
            }
        };

        let (kill_tx, kill_rx) = mpsc::channel(1);
        *self.process.write().await = Some(ProcessHandle { kill_tx });

        let feeder = match stored_input {
            Some(input) => Some(tokio::spawn(feed_input(input, stdin))),
            None => {
                if let Input::Interactive { attached } = &mut *self.input.lock().await {
                    *attached = Some(Arc::new(AttachedInput::new(stdin)));
                }
                None
            }
        };
        let logs_task = tokio::spawn(drain(StreamKind::Logs, stderr, logs));
        let output_task = tokio::spawn(drain(StreamKind::Output, stdout, output));

        let waited = manage_process(&mut process, kill_rx).await;

        *self.process.write().await = None;
        if let Input::Interactive { attached } = &mut *self.input.lock().await {
            if let Some(attached) = attached.take() {
                attached.detach();
            }
        }

        // both drains finish before we report, whatever the exit looked like
        let reports = [
            join_drain(StreamKind::Output, output_task).await,
            join_drain(StreamKind::Logs, logs_task).await,
            match feeder {
                Some(feeder) => join_feeder(feeder).await,
                None => DrainReport {
                    kind: StreamKind::Input,
                    written: 0,
                    result: Ok(()),
                },
            },
        ];

        let status = waited.map_err(|source| {
            error!("error waiting for job #{}: {}", self.id, source);
            Error::Process {
                id: self.id,
                source,
            }
        })?;
        let exit = ProcessExit::from(status);
        info!("process exited: {}", exit);
        if let Some(code) = exit.code() {
            let mut record = self.record.lock().await;
            record.status = code;
            self.save(&record).await?;
        }

        let mut truncated = None;
        for report in reports {
            if let Err(source) = report.result {
                error!(
                    "{} stream of job #{} truncated after {} bytes: {}",
                    report.kind, self.id, report.written, source
                );
                if truncated.is_none() {
                    truncated = Some(Error::Truncated {
                        id: self.id,
                        kind: report.kind,
                        written: report.written,
                        exit,
                        source,
                    });
                }
            }
        }
        match truncated {
            Some(err) => Err(err),
            None => Ok(exit),
        }
    }

    fn claim_termination(&self, state: State) -> Result<()> {
        if state.is_terminal() {
            return Err(Error::AlreadyTerminated { id: self.id, state });
        }
        if state != State::Running {
            return Err(Error::invalid(
                self.id,
                format!("cannot terminate a job in state {}", state),
            ));
        }
        if !self.completion.claim() {
            return Err(Error::AlreadyTerminated { id: self.id, state });
        }
        Ok(())
    }

    async fn save(&self, record: &JobSnapshot) -> Result<()> {
        self.store.save(record).await.map_err(|err| {
            error!("error saving job #{}: {}", self.id, err);
            Error::Persistence(err)
        })
    }

    async fn open_read(&self, kind: StreamKind) -> Result<ByteReader> {
        self.data
            .open_read(self.id, kind)
            .await
            .map_err(|source| self.stream_error(kind, source))
    }

    async fn open_write(&self, kind: StreamKind) -> Result<ByteWriter> {
        self.data
            .open_write(self.id, kind)
            .await
            .map_err(|source| self.stream_error(kind, source))
    }

    fn stream_error(&self, kind: StreamKind, source: io::Error) -> Error {
        error!("error opening {} for job #{}: {}", kind, self.id, source);
        Error::StreamStore {
            id: self.id,
            kind,
            source,
        }
    }
}

async fn request_kill(kill_tx: mpsc::Sender<KillRequest>, signal: KillSignal) -> io::Result<()> {
    let (reply, reply_rx) = oneshot::channel();
    if kill_tx.send(KillRequest { signal, reply }).await.is_err() {
        return Err(io::Error::other("process already exited"));
    }
    match reply_rx.await {
        Ok(result) => result,
        Err(_) => Err(io::Error::other("process exited before it could be killed")),
    }
}

async fn join_drain(kind: StreamKind, task: JoinHandle<DrainReport>) -> DrainReport {
    match task.await {
        Ok(report) => report,
        Err(join_error) => {
            warn!("unexpected error when joining {} drain: {}", kind, join_error);
            DrainReport {
                kind,
                written: 0,
                result: Err(io::Error::other(join_error)),
            }
        }
    }
}

async fn join_feeder(task: JoinHandle<io::Result<u64>>) -> DrainReport {
    let (written, result) = match task.await {
        Ok(Ok(written)) => (written, Ok(())),
        Ok(Err(err)) => (0, Err(err)),
        Err(join_error) => (0, Err(io::Error::other(join_error))),
    };
    DrainReport {
        kind: StreamKind::Input,
        written,
        result,
    }
}
