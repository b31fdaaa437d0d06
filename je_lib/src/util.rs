use std::{fmt, process::ExitStatus};

use je_data::StreamKind;
use tokio::{
    io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    process::Child,
    sync::{mpsc, oneshot},
};
use tracing::{info, warn};

const DRAIN_BUFFER_SIZE: usize = 8 * 1024;

/// What to deliver to a managed process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KillSignal {
    /// SIGINT, the process may handle it
    Interrupt,
    Kill,
}

/// Signal request sent to the task waiting on a process, answered once delivered.
#[derive(Debug)]
pub struct KillRequest {
    pub signal: KillSignal,
    pub reply: oneshot::Sender<io::Result<()>>,
}

/// How a process ended, independent of the platform's wait status encoding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Terminated by a signal; the number is unknown on some platforms.
    Signal(Option<i32>),
}

impl ProcessExit {
    pub fn code(self) -> Option<i32> {
        match self {
            ProcessExit::Code(code) => Some(code),
            ProcessExit::Signal(_) => None,
        }
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        match status.code() {
            Some(code) => ProcessExit::Code(code),
            None => ProcessExit::Signal(exit_signal(&status)),
        }
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Code(code) => write!(f, "exit code {}", code),
            ProcessExit::Signal(Some(signal)) => write!(f, "killed by signal {}", signal),
            ProcessExit::Signal(None) => write!(f, "killed by signal"),
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Outcome of one drain task, kept per stream so the two tasks never share state.
#[derive(Debug)]
pub struct DrainReport {
    pub kind: StreamKind,
    pub written: u64,
    pub result: io::Result<()>,
}

/// Waits for the process to exit while serving kill requests.
/// A served kill request does not end the wait, the exit status is still collected.
/// Signals are only delivered from here, while the child is not reaped yet.
pub async fn manage_process(
    process: &mut Child,
    mut kill_requests: mpsc::Receiver<KillRequest>,
) -> io::Result<ExitStatus> {
    loop {
        tokio::select! {
            status = process.wait() => return status,
            Some(KillRequest { signal, reply }) = kill_requests.recv() => {
                let result = match signal {
                    KillSignal::Kill => {
                        info!("killing process, pid: {:?}", process.id());
                        process.start_kill()
                    }
                    KillSignal::Interrupt => match process.id() {
                        Some(pid) => {
                            info!("interrupting process, pid: {}", pid);
                            interrupt(pid)
                        }
                        None => Err(io::Error::other("process has already been reaped")),
                    },
                };
                if let Err(err) = &result {
                    warn!("unexpected error when signalling process, pid: {:?}, err: {}", process.id(), err);
                }
                if reply.send(result).is_err() {
                    warn!("kill requester went away before the reply, pid: {:?}", process.id());
                }
            }
        }
    }
}

/// Copies a process stream into its sink until end of stream, counting every
/// byte that reached the sink. The sink is flushed and shut down in all cases.
pub async fn drain<R, W>(kind: StreamKind, mut stream: R, mut sink: W) -> DrainReport
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; DRAIN_BUFFER_SIZE];
    let mut written = 0u64;
    let mut result = Ok(());
    loop {
        let n = match stream.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => {
                result = Err(err);
                break;
            }
        };
        if let Err(err) = sink.write_all(&buffer[..n]).await {
            result = Err(err);
            break;
        }
        written += n as u64;
    }
    let closed = sink.shutdown().await;
    if result.is_ok() {
        result = closed;
    }
    DrainReport {
        kind,
        written,
        result,
    }
}

/// Feeds stored input into a process and closes its stdin afterwards.
/// A process that exits without reading all of its input is not an error.
pub async fn feed_input<R, W>(mut input: R, mut stdin: W) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let copied = match io::copy(&mut input, &mut stdin).await {
        Ok(copied) => copied,
        Err(err) if err.kind() == io::ErrorKind::BrokenPipe => return Ok(0),
        Err(err) => return Err(err),
    };
    match stdin.shutdown().await {
        Err(err) if err.kind() != io::ErrorKind::BrokenPipe => Err(err),
        _ => Ok(copied),
    }
}

#[cfg(unix)]
fn interrupt(pid: u32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    if unsafe { libc::kill(pid, libc::SIGINT) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn interrupt(_pid: u32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "interrupting processes is only supported on unix",
    ))
}

#[cfg(test)]
mod test {
    use std::{
        io::{self, Cursor},
        pin::Pin,
        task::{Context, Poll},
    };

    use je_data::StreamKind;
    use tokio::{
        io::AsyncWrite,
        process::Command,
        sync::{mpsc, oneshot},
    };

    use super::{drain, feed_input, manage_process, KillRequest, KillSignal, ProcessExit};
    use crate::testing::RUNTIME;

    // accepts `limit` bytes and then fails every write
    struct FailingSink {
        accepted: Vec<u8>,
        limit: usize,
    }

    impl AsyncWrite for FailingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            let room = self.limit - self.accepted.len();
            if room == 0 {
                return Poll::Ready(Err(io::Error::other("disk full")));
            }
            let n = room.min(buf.len());
            self.accepted.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_drain_copies_everything_in_order() {
        let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
        RUNTIME.block_on(async {
            let mut sink = Vec::new();
            let report = drain(StreamKind::Output, Cursor::new(payload.clone()), &mut sink).await;
            assert!(report.result.is_ok());
            assert_eq!(payload.len() as u64, report.written);
            assert_eq!(payload, sink);
        });
    }

    #[test]
    fn test_drain_reports_truncation() {
        RUNTIME.block_on(async {
            let sink = FailingSink {
                accepted: Vec::new(),
                limit: 4,
            };
            let report = drain(StreamKind::Logs, Cursor::new(b"0123456789".to_vec()), sink).await;
            assert_eq!(StreamKind::Logs, report.kind);
            assert!(report.result.is_err());
            assert!(report.written < 10);
        });
    }

    #[test]
    fn test_feed_input() {
        RUNTIME.block_on(async {
            let mut stdin = Vec::new();
            let copied = feed_input(Cursor::new(b"ping\n".to_vec()), &mut stdin)
                .await
                .unwrap();
            assert_eq!(5, copied);
            assert_eq!(b"ping\n".to_vec(), stdin);
        });
    }

    // testing signals are served until the child is reaped, never after
    #[test]
    fn test_manage_process_signals() {
        RUNTIME.block_on(async {
            let mut child = Command::new("sleep")
                .arg("30")
                .kill_on_drop(true)
                .spawn()
                .unwrap();
            let (kill_tx, kill_rx) = mpsc::channel(1);
            let manager = tokio::spawn(async move { manage_process(&mut child, kill_rx).await });

            let (reply, replied) = oneshot::channel();
            kill_tx
                .send(KillRequest {
                    signal: KillSignal::Interrupt,
                    reply,
                })
                .await
                .unwrap();
            replied.await.unwrap().unwrap();
            // SIGINT may already have ended it
            let (reply, replied) = oneshot::channel();
            let request = KillRequest {
                signal: KillSignal::Kill,
                reply,
            };
            if kill_tx.send(request).await.is_ok() {
                let _ = replied.await;
            }

            let status = manager.await.unwrap().unwrap();
            assert_eq!(None, ProcessExit::from(status).code());
            let (reply, _replied) = oneshot::channel();
            let late = KillRequest {
                signal: KillSignal::Interrupt,
                reply,
            };
            assert!(kill_tx.send(late).await.is_err());
        });
    }

    #[test]
    fn test_exit_decoding() {
        assert_eq!(Some(3), ProcessExit::Code(3).code());
        assert_eq!(None, ProcessExit::Signal(Some(9)).code());
        assert_eq!("exit code 0", ProcessExit::Code(0).to_string());
        assert_eq!("killed by signal 9", ProcessExit::Signal(Some(9)).to_string());
    }
}
