use std::{
    collections::HashMap,
    io::{self, Cursor},
    path::{Path, PathBuf},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    task::{Context, Poll},
};

use async_trait::async_trait;
use je_data::{JobId, JobSnapshot, StreamKind};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::Mutex,
};
use tracing::debug;

pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;
pub type ByteWriter = Box<dyn AsyncWrite + Send + Unpin>;

const NEXT_ID_FILE: &str = "next_id";
const FIRST_ID: u64 = 1;

/// Durable record store for job snapshots.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &JobSnapshot) -> io::Result<()>;

    /// Allocates a fresh identifier, never handed out twice.
    async fn next_id(&self) -> io::Result<JobId>;
}

/// Byte streams of a job, addressed by (job id, stream kind).
///
/// Reading a stream that was never written yields an empty stream.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn open_read(&self, id: JobId, kind: StreamKind) -> io::Result<ByteReader>;
    async fn open_write(&self, id: JobId, kind: StreamKind) -> io::Result<ByteWriter>;
}

pub struct MemoryJobStore {
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobSnapshot>>,
}

impl MemoryJobStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(FIRST_ID),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.lock().await.get(&id).cloned()
    }

    pub async fn all(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.jobs.lock().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.id);
        jobs
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn save(&self, job: &JobSnapshot) -> io::Result<()> {
        self.jobs.lock().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn next_id(&self) -> io::Result<JobId> {
        Ok(JobId(self.next_id.fetch_add(1, Ordering::SeqCst)))
    }
}

/// Snapshot store keeping one JSON document per job below a root directory.
pub struct FsJobStore {
    root: PathBuf,
    // guards the counter file, allocation must be serialized to stay monotonic
    next_id: Mutex<u64>,
}

impl FsJobStore {
    pub async fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let next_id = match fs::read_to_string(root.join(NEXT_ID_FILE)).await {
            Ok(raw) => raw.trim().parse::<u64>().map_err(|err| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt id counter: {}", err),
                )
            })?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => FIRST_ID,
            Err(err) => return Err(err),
        };
        debug!("opened job store at {:?}, next id {}", root, next_id);
        Ok(Self {
            root,
            next_id: Mutex::new(next_id),
        })
    }

    pub async fn load(&self, id: JobId) -> io::Result<Option<JobSnapshot>> {
        match fs::read(self.snapshot_path(id)).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn snapshot_path(&self, id: JobId) -> PathBuf {
        self.root.join(format!("{}.json", id))
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn save(&self, job: &JobSnapshot) -> io::Result<()> {
        let raw = serde_json::to_vec_pretty(job)?;
        write_atomic(&self.snapshot_path(job.id), &raw).await
    }

    async fn next_id(&self) -> io::Result<JobId> {
        let mut next_id = self.next_id.lock().await;
        let id = *next_id;
        write_atomic(&self.root.join(NEXT_ID_FILE), (id + 1).to_string().as_bytes()).await?;
        *next_id = id + 1;
        Ok(JobId(id))
    }
}

/// write to a sibling file, sync it and rename over the target
async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await
}

type SharedBuffer = Arc<StdMutex<Vec<u8>>>;

/// In-process stream store, mostly useful for embedding and tests.
#[derive(Default)]
pub struct MemoryDataStore {
    streams: StdMutex<HashMap<(JobId, StreamKind), SharedBuffer>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents of a stream, typically to seed a job's input.
    pub fn put(&self, id: JobId, kind: StreamKind, bytes: &[u8]) -> io::Result<()> {
        let buffer = Arc::new(StdMutex::new(bytes.to_vec()));
        self.streams
            .lock()
            .map_err(|_| poisoned())?
            .insert((id, kind), buffer);
        Ok(())
    }

    pub fn contents(&self, id: JobId, kind: StreamKind) -> Option<Vec<u8>> {
        let streams = self.streams.lock().ok()?;
        let buffer = streams.get(&(id, kind))?.lock().ok()?;
        Some(buffer.clone())
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn open_read(&self, id: JobId, kind: StreamKind) -> io::Result<ByteReader> {
        let bytes = self.contents(id, kind).unwrap_or_default();
        Ok(Box::new(Cursor::new(bytes)))
    }

    async fn open_write(&self, id: JobId, kind: StreamKind) -> io::Result<ByteWriter> {
        let buffer = SharedBuffer::default();
        self.streams
            .lock()
            .map_err(|_| poisoned())?
            .insert((id, kind), buffer.clone());
        Ok(Box::new(BufferWriter(buffer)))
    }
}

struct BufferWriter(SharedBuffer);

impl AsyncWrite for BufferWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.0.lock() {
            Ok(mut buffer) => {
                buffer.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            Err(_) => Poll::Ready(Err(poisoned())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

fn poisoned() -> io::Error {
    io::Error::other("stream buffer lock poisoned")
}

/// Stream store laid out as `<root>/<job id>/<kind>`.
pub struct FsDataStore {
    root: PathBuf,
}

impl FsDataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, id: JobId, kind: StreamKind) -> PathBuf {
        self.root.join(id.to_string()).join(kind.as_str())
    }
}

#[async_trait]
impl DataStore for FsDataStore {
    async fn open_read(&self, id: JobId, kind: StreamKind) -> io::Result<ByteReader> {
        match File::open(self.path(id, kind)).await {
            Ok(file) => Ok(Box::new(file)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Box::new(Cursor::new(Vec::new())))
            }
            Err(err) => Err(err),
        }
    }

    async fn open_write(&self, id: JobId, kind: StreamKind) -> io::Result<ByteWriter> {
        fs::create_dir_all(self.root.join(id.to_string())).await?;
        let file = File::create(self.path(id, kind)).await?;
        Ok(Box::new(file))
    }
}
