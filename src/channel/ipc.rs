//! Process-channel backends: envelopes as newline-delimited JSON.
//!
//! Two roles share one implementation:
//! - **Parent**: owns a spawned child process and speaks over the
//!   child's stdin/stdout.
//! - **Child**: speaks to its parent over the process's own
//!   stdin/stdout. Logs must go to stderr; stdout carries envelopes.
//!
//! Framing is one JSON envelope per line, written with an explicit `\n`
//! and flushed immediately so the peer never waits on a partial line.
//! Neither role reconnects: when the pipe closes the channel is done.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Capabilities, Channel, DisconnectHook, InboundHandler};
use crate::envelope::Envelope;
use crate::error::{OutboxError, Result};
use crate::heartbeat::Liveness;

/// Capacity of the outbound line queue.
const OUTBOUND_QUEUE: usize = 256;

/// Which end of the process channel this instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcRole {
    /// Owns the child process.
    Parent,
    /// Runs inside the child, bound to its own stdio.
    Child,
}

/// A process-channel transport endpoint.
pub struct IpcChannel {
    shared: Arc<IpcShared>,
    child: Mutex<Option<Child>>,
}

struct IpcShared {
    role: IpcRole,
    liveness: Liveness,
    connected: AtomicBool,
    closed: AtomicBool,
    inbound: Mutex<Option<InboundHandler>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
    outbound: Mutex<Option<mpsc::Sender<String>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl IpcChannel {
    /// Spawn `command` with piped stdio and bind the channel to the
    /// child's stdin/stdout. The child is killed on `close()`.
    pub fn parent(mut command: Command, liveness: Liveness) -> Result<Self> {
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| OutboxError::TransportInit(format!("failed to spawn child: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OutboxError::TransportInit("child stdout not piped".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OutboxError::TransportInit("child stdin not piped".into()))?;

        let channel = Self::from_io(stdout, stdin, IpcRole::Parent, liveness);
        *channel.child.lock().expect("child slot poisoned") = Some(child);
        Ok(channel)
    }

    /// Bind the channel to this process's own stdin/stdout (child role).
    pub fn child(liveness: Liveness) -> Self {
        Self::from_io(
            tokio::io::stdin(),
            tokio::io::stdout(),
            IpcRole::Child,
            liveness,
        )
    }

    /// Bind the channel over arbitrary I/O halves. Used by the role
    /// constructors and directly by tests over `tokio::io::duplex`.
    pub fn from_io<R, W>(reader: R, writer: W, role: IpcRole, liveness: Liveness) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let shared = Arc::new(IpcShared {
            role,
            liveness,
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            outbound: Mutex::new(Some(tx)),
            tasks: Mutex::new(Vec::new()),
        });

        let writer_task = tokio::spawn(write_loop(rx, writer));
        let reader_task = tokio::spawn(read_loop(reader, shared.clone()));
        {
            let mut tasks = shared.tasks.lock().expect("task slot poisoned");
            tasks.push(writer_task);
            tasks.push(reader_task);
        }

        Self {
            shared,
            child: Mutex::new(None),
        }
    }

    /// Which end of the channel this is.
    pub fn role(&self) -> IpcRole {
        self.shared.role
    }
}

impl IpcShared {
    /// Flip to disconnected exactly once and fire the hook. IPC never
    /// reconnects, so every disconnect is terminal.
    fn mark_disconnected(&self) {
        if self.connected.swap(false, Ordering::AcqRel) {
            self.liveness.reset();
            let hook = self
                .on_disconnect
                .lock()
                .expect("hook slot poisoned")
                .clone();
            if let Some(hook) = hook {
                hook(true);
            }
        }
    }
}

/// Read JSON lines, decode envelopes, and feed them to the inbound
/// handler in arrival order. Handler replies go back out on the same
/// channel.
async fn read_loop<R>(reader: R, shared: Arc<IpcShared>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    warn!(error = %e, "ipc read failed");
                }
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let env: Envelope = match serde_json::from_str(&line) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping undecodable ipc line");
                continue;
            }
        };

        let handler = shared
            .inbound
            .lock()
            .expect("inbound slot poisoned")
            .clone();
        let Some(handler) = handler else {
            debug!(action = %env.action, "no inbound handler installed, dropping");
            continue;
        };

        if let Some(reply) = handler(env).await {
            let tx = shared
                .outbound
                .lock()
                .expect("outbound slot poisoned")
                .clone();
            let Some(tx) = tx else { break };
            match serde_json::to_string(&reply) {
                Ok(text) => {
                    if tx.send(text).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode reply envelope"),
            }
        }
    }

    shared.mark_disconnected();
}

/// Drain the outbound queue onto the pipe: line, `\n`, flush.
async fn write_loop<W>(mut rx: mpsc::Receiver<String>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let write = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        };
        if let Err(e) = write.await {
            warn!(error = %e, "ipc write failed");
            break;
        }
    }
}

#[async_trait::async_trait]
impl Channel for IpcChannel {
    /// I/O is bound at construction; open only validates it still holds.
    async fn open(&self) -> Result<()> {
        if self.shared.connected.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(OutboxError::NotConnected)
        }
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.connected.store(false, Ordering::Release);
        self.shared
            .outbound
            .lock()
            .expect("outbound slot poisoned")
            .take();
        self.shared
            .inbound
            .lock()
            .expect("inbound slot poisoned")
            .take();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().expect("task slot poisoned"));
        for task in tasks {
            task.abort();
        }

        if let Some(mut child) = self.child.lock().expect("child slot poisoned").take() {
            if let Err(e) = child.start_kill() {
                debug!(error = %e, "child already gone on close");
            }
        }
        self.shared.liveness.reset();
    }

    fn is_ready(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && self.shared.liveness.is_live()
    }

    async fn await_ready(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if self.is_ready() {
                return true;
            }
            if !self.shared.connected.load(Ordering::Acquire) {
                return false;
            }
            let remaining = deadline.saturating_sub(start.elapsed());
            self.shared
                .liveness
                .wait_live(remaining.min(Duration::from_millis(50)))
                .await;
        }
        self.is_ready()
    }

    async fn send(&self, env: Envelope) -> Result<Option<Envelope>> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(OutboxError::NotConnected);
        }
        let tx = self
            .shared
            .outbound
            .lock()
            .expect("outbound slot poisoned")
            .clone()
            .ok_or(OutboxError::NotConnected)?;

        let text = serde_json::to_string(&env)?;
        tx.send(text)
            .await
            .map_err(|_| OutboxError::NotConnected)?;
        Ok(None)
    }

    fn set_inbound(&self, handler: InboundHandler) {
        *self.shared.inbound.lock().expect("inbound slot poisoned") = Some(handler);
    }

    fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self
            .shared
            .on_disconnect
            .lock()
            .expect("hook slot poisoned") = Some(hook);
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            queries: true,
            stream_acks: true,
        }
    }
}
