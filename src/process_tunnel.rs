//! Bridges a [`crate::tunnel::TunnelStream`] to an external process-like
//! unit exposing stdin/stdout/optional stderr (spec §4.6).

use std::future::pending;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::call::CallEvent;
use crate::error::Result;
use crate::listener::Disposer;
use crate::tunnel::TunnelStream;

const COPY_BUFFER_SIZE: usize = 8192;

/// A process-like unit: something with a byte-oriented stdin, stdout, and
/// optional stderr, plus optional start/stop lifecycle hooks.
///
/// `stdio_mut` returns independent mutable handles to each stream so the
/// copy loop can read stdout and write stdin concurrently; implementors
/// split their own distinct fields rather than reborrowing `self` per
/// stream, which is what lets the three returned references coexist.
#[async_trait]
pub trait Process: Send + 'static {
    type Stdin: tokio::io::AsyncWrite + Unpin + Send;
    type Stdout: tokio::io::AsyncRead + Unpin + Send;
    type Stderr: tokio::io::AsyncRead + Unpin + Send;

    /// Called once before piping begins. Default no-op for processes that
    /// are already running by the time they're handed to `tunnel()`.
    async fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called once when the tunnel handle closes. Default no-op.
    async fn stop(&mut self, _reason: Option<String>) -> Result<()> {
        Ok(())
    }

    fn stdio_mut(&mut self) -> (&mut Self::Stdin, &mut Self::Stdout, Option<&mut Self::Stderr>);
}

/// Options for [`crate::call::Call::tunnel`].
#[derive(Clone)]
pub struct TunnelOptions {
    /// If true, the call's `hangup` event closes this tunnel handle.
    pub close_on_hangup: bool,
    /// If true, stderr chunks are also delivered to `on_stderr_chunk`.
    pub forward_stderr: bool,
    /// Observer invoked with each stderr chunk, when `forward_stderr` and
    /// the process exposes a stderr stream.
    pub on_stderr_chunk: Option<Arc<dyn Fn(Vec<u8>) + Send + Sync>>,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            close_on_hangup: true,
            forward_stderr: true,
            on_stderr_chunk: None,
        }
    }
}

struct HandleInner {
    closed: AtomicBool,
    stop_tx: Mutex<Option<oneshot::Sender<Option<String>>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    hangup_disposer: Mutex<Option<Disposer<CallEvent>>>,
}

/// A handle to an in-progress process tunnel. `close` is idempotent.
#[derive(Clone)]
pub struct TunnelHandle {
    inner: Arc<HandleInner>,
}

impl TunnelHandle {
    /// Detaches the pipes, signals the copy loop to stop, and awaits the
    /// process's `stop()`. Safe to call more than once; only the first
    /// call does anything.
    pub async fn close(&self, reason: Option<String>) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(tx) = self.inner.stop_tx.lock().unwrap().take() {
            let _ = tx.send(reason);
        }
        let join = self.inner.join.lock().unwrap().take();
        if let Some(join) = join {
            let _ = join.await;
        }
        self.inner.hangup_disposer.lock().unwrap().take();
    }

    pub(crate) fn attach_hangup_disposer(&self, disposer: Disposer<CallEvent>) {
        *self.inner.hangup_disposer.lock().unwrap() = Some(disposer);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Starts `process`, then bidirectionally pipes `process.stdout`/`stdin`
/// against `stream`, forwarding stderr chunks to `options.on_stderr_chunk`
/// when present. A process end does not close `stream`, and a remote
/// end-of-stream does not stop the process — each direction drains
/// independently.
pub async fn tunnel<P: Process>(
    mut process: P,
    stream: TunnelStream,
    options: TunnelOptions,
) -> Result<TunnelHandle> {
    process.start().await?;

    let (stop_tx, mut stop_rx) = oneshot::channel::<Option<String>>();

    let join = tokio::spawn(async move {
        let mut stdout_open = true;
        let mut stdin_open = true;
        let mut read_buf = vec![0u8; COPY_BUFFER_SIZE];
        let mut err_buf = vec![0u8; COPY_BUFFER_SIZE];

        loop {
            if !stdout_open && !stdin_open {
                break;
            }
            let (_, stdout, mut stderr) = process.stdio_mut();

            let stdout_fut = async {
                if stdout_open {
                    stdout.read(&mut read_buf).await
                } else {
                    pending().await
                }
            };
            let stream_fut = async {
                if stdin_open {
                    stream.read().await
                } else {
                    pending().await
                }
            };
            let stderr_fut = async {
                match &mut stderr {
                    Some(s) if options.forward_stderr => s.read(&mut err_buf).await,
                    _ => pending().await,
                }
            };

            tokio::select! {
                n = stdout_fut => {
                    match n {
                        Ok(0) | Err(_) => stdout_open = false,
                        Ok(n) => {
                            if stream.write(read_buf[..n].to_vec()).await.is_err() {
                                stdout_open = false;
                            }
                        }
                    }
                }
                chunk = stream_fut => {
                    match chunk {
                        Some(bytes) => {
                            let (stdin, _, _) = process.stdio_mut();
                            if stdin.write_all(&bytes).await.is_err() {
                                stdin_open = false;
                            }
                        }
                        None => stdin_open = false,
                    }
                }
                n = stderr_fut => {
                    if let Ok(n) = n {
                        if n > 0 {
                            if let Some(cb) = &options.on_stderr_chunk {
                                cb(err_buf[..n].to_vec());
                            }
                        }
                    }
                }
                reason = &mut stop_rx => {
                    let reason = reason.unwrap_or(None);
                    let _ = process.stop(reason).await;
                    break;
                }
            }
        }
    });

    Ok(TunnelHandle {
        inner: Arc::new(HandleInner {
            closed: AtomicBool::new(false),
            stop_tx: Mutex::new(Some(stop_tx)),
            join: Mutex::new(Some(join)),
            hangup_disposer: Mutex::new(None),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineCommand;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    /// A fake process whose worker task uppercases whatever arrives on its
    /// stdin and writes the result to its stdout, mirroring scenario 4's
    /// "stdout = upper-case of stdin" contract.
    struct UppercaseProcess {
        stdin: DuplexStream,
        stdout: DuplexStream,
        stderr: DuplexStream,
    }

    impl UppercaseProcess {
        fn spawn() -> Self {
            let (stdin, worker_read) = tokio::io::duplex(4096);
            let (worker_write, stdout) = tokio::io::duplex(4096);
            let (_unused_err_write, stderr) = tokio::io::duplex(4096);

            tokio::spawn(async move {
                let mut worker_read = worker_read;
                let mut worker_write = worker_write;
                let mut buf = vec![0u8; 4096];
                loop {
                    match worker_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let upper: Vec<u8> = buf[..n].to_ascii_uppercase();
                            if worker_write.write_all(&upper).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            Self {
                stdin,
                stdout,
                stderr,
            }
        }
    }

    #[async_trait]
    impl Process for UppercaseProcess {
        type Stdin = DuplexStream;
        type Stdout = DuplexStream;
        type Stderr = DuplexStream;

        fn stdio_mut(
            &mut self,
        ) -> (&mut Self::Stdin, &mut Self::Stdout, Option<&mut Self::Stderr>) {
            (&mut self.stdin, &mut self.stdout, Some(&mut self.stderr))
        }
    }

    #[test]
    fn default_options_match_spec() {
        let options = TunnelOptions::default();
        assert!(options.close_on_hangup);
        assert!(options.forward_stderr);
    }

    #[tokio::test]
    async fn pipes_stdin_to_stdout_through_tunnel() {
        let captured: Arc<StdMutex<Vec<u8>>> = Arc::new(StdMutex::new(Vec::new()));
        let captured_clone = captured.clone();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                if let EngineCommand::TunnelWrite { bytes, respond, .. } = cmd {
                    captured_clone.lock().unwrap().extend_from_slice(&bytes);
                    let _ = respond.send(Ok(()));
                }
            }
        });
        let controller = crate::call::CallController::new("call-x".to_string(), tx);
        let stream = TunnelStream::new("call-x".to_string(), controller);

        let process = UppercaseProcess::spawn();
        let handle = tunnel(process, stream.clone(), TunnelOptions::default())
            .await
            .unwrap();

        stream.push_inbound(b"hello shells\n".to_vec());

        // Give the copy loop and the fake process worker a chance to run;
        // current-thread runtime schedules them at this await point.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(&*captured.lock().unwrap(), b"HELLO SHELLS\n");

        handle.close(None).await;
        assert!(handle.is_closed());
    }
}
