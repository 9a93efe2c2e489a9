//! Persistent bidirectional WebSocket backend.
//!
//! Two ownership modes:
//! - **Managed**: the channel owns the connection. `open()` dials the
//!   URL and a background loop redials on loss with exponential backoff
//!   and jitter until `close()`.
//! - **Attached**: the host owns the socket and hands the stream over;
//!   the channel binds listeners and never reconnects.
//!
//! Envelopes travel as text frames, one JSON document per frame. The
//! connection's business state follows the handshake: the socket is
//! usable for client-initiated requests only after the first Ping/Pong
//! exchange, and only while the last Pong stays inside the heartbeat
//! window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, warn};

use crate::channel::{Capabilities, Channel, DisconnectHook, InboundHandler};
use crate::config::ReconnectPolicy;
use crate::envelope::Envelope;
use crate::error::{OutboxError, Result};
use crate::heartbeat::Liveness;

/// Capacity of the outbound frame queue.
const OUTBOUND_QUEUE: usize = 256;

/// Connection lifecycle state.
///
/// `OpenUnverified` means the I/O is up but the first Ping/Pong exchange
/// has not happened yet; queries stay gated until `OpenReady`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Closed,
    Opening,
    OpenUnverified,
    OpenReady,
    Closing,
}

enum Mode {
    Managed {
        url: String,
        reconnect: ReconnectPolicy,
        connect_timeout: Duration,
    },
    Attached,
}

type Starter = Box<dyn FnOnce(Arc<SocketShared>) -> JoinHandle<()> + Send>;

/// A WebSocket transport endpoint.
pub struct SocketChannel {
    shared: Arc<SocketShared>,
    starter: Mutex<Option<Starter>>,
}

struct SocketShared {
    mode: Mode,
    liveness: Liveness,
    state: Mutex<ConnState>,
    opened: AtomicBool,
    closed: AtomicBool,
    inbound: Mutex<Option<InboundHandler>>,
    on_disconnect: Mutex<Option<DisconnectHook>>,
    outbound: Mutex<Option<mpsc::Sender<Message>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketChannel {
    /// A managed channel that owns and redials `url`.
    pub fn managed(
        url: impl Into<String>,
        reconnect: ReconnectPolicy,
        connect_timeout: Duration,
        liveness: Liveness,
    ) -> Self {
        Self {
            shared: Arc::new(SocketShared::new(
                Mode::Managed {
                    url: url.into(),
                    reconnect,
                    connect_timeout,
                },
                liveness,
            )),
            starter: Mutex::new(None),
        }
    }

    /// An attached channel over a host-owned, already-connected stream.
    /// Binds listeners on `open()`; never reconnects.
    pub fn attached<S>(ws: WebSocketStream<S>, liveness: Liveness) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let starter: Starter = Box::new(move |shared: Arc<SocketShared>| {
            tokio::spawn(async move {
                shared.set_state(ConnState::OpenUnverified);
                run_connection(shared.clone(), ws).await;
                shared.finish(true);
            })
        });
        Self {
            shared: Arc::new(SocketShared::new(Mode::Attached, liveness)),
            starter: Mutex::new(Some(starter)),
        }
    }

    /// The current lifecycle state, with the handshake folded in.
    pub fn state(&self) -> ConnState {
        let state = *self.shared.state.lock().expect("state poisoned");
        match state {
            ConnState::OpenUnverified if self.shared.liveness.handshake_complete() => {
                ConnState::OpenReady
            }
            other => other,
        }
    }
}

impl SocketShared {
    fn new(mode: Mode, liveness: Liveness) -> Self {
        Self {
            mode,
            liveness,
            state: Mutex::new(ConnState::Closed),
            opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            inbound: Mutex::new(None),
            on_disconnect: Mutex::new(None),
            outbound: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn set_state(&self, state: ConnState) {
        *self.state.lock().expect("state poisoned") = state;
    }

    fn io_up(&self) -> bool {
        matches!(
            *self.state.lock().expect("state poisoned"),
            ConnState::OpenUnverified | ConnState::OpenReady
        )
    }

    /// One connection ended. Resets the handshake and fires the hook;
    /// terminal disconnects also settle the lifecycle state.
    fn finish(&self, terminal: bool) {
        self.outbound.lock().expect("outbound poisoned").take();
        self.liveness.reset();
        if terminal {
            self.set_state(ConnState::Closed);
        }
        let hook = self.on_disconnect.lock().expect("hook poisoned").clone();
        if let Some(hook) = hook {
            hook(terminal);
        }
    }
}

/// Pump one established connection: writer task drains the outbound
/// queue, the read side decodes text frames and feeds the inbound
/// handler in arrival order.
async fn run_connection<S>(shared: Arc<SocketShared>, ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);
    *shared.outbound.lock().expect("outbound poisoned") = Some(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(error = %e, "socket write failed");
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                if !shared.closed.load(Ordering::Acquire) {
                    warn!(error = %e, "socket read failed");
                }
                break;
            }
        };

        let env: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                continue;
            }
        };

        let handler = shared.inbound.lock().expect("inbound poisoned").clone();
        let Some(handler) = handler else {
            debug!(action = %env.action, "no inbound handler installed, dropping");
            continue;
        };

        if let Some(reply) = handler(env).await {
            match serde_json::to_string(&reply) {
                Ok(out) => {
                    if tx.send(Message::Text(out)).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "failed to encode reply envelope"),
            }
        }
    }

    writer.abort();
}

/// Managed dial-and-redial loop. The first connection is already
/// established by `open()`; afterwards the loop owns reconnection until
/// the channel closes or the policy disables it.
async fn run_managed<S>(shared: Arc<SocketShared>, first: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let Mode::Managed {
        ref url,
        ref reconnect,
        connect_timeout,
    } = shared.mode
    else {
        unreachable!("managed loop on attached channel");
    };

    shared.set_state(ConnState::OpenUnverified);
    run_connection(shared.clone(), first).await;

    let mut delay = reconnect.min_delay;
    loop {
        let terminal = shared.closed.load(Ordering::Acquire) || !reconnect.enabled;
        shared.finish(terminal);
        if terminal {
            return;
        }

        // Redial with backoff until something answers.
        let ws = loop {
            if shared.closed.load(Ordering::Acquire) {
                shared.set_state(ConnState::Closed);
                return;
            }
            shared.set_state(ConnState::Opening);
            let sleep_for = reconnect.jittered(delay);
            match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
                Ok(Ok((ws, _response))) => break ws,
                Ok(Err(e)) => warn!(error = %e, delay_ms = sleep_for.as_millis() as u64, "reconnect failed"),
                Err(_) => warn!(delay_ms = sleep_for.as_millis() as u64, "reconnect timed out"),
            }
            tokio::time::sleep(sleep_for).await;
            delay = reconnect.next_delay(delay);
        };

        delay = reconnect.min_delay;
        shared.set_state(ConnState::OpenUnverified);
        run_connection(shared.clone(), ws).await;
    }
}

#[async_trait::async_trait]
impl Channel for SocketChannel {
    async fn open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(OutboxError::NotConnected);
        }
        if self.shared.opened.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        match &self.shared.mode {
            Mode::Managed {
                url,
                connect_timeout,
                ..
            } => {
                self.shared.set_state(ConnState::Opening);
                let connected =
                    tokio::time::timeout(*connect_timeout, connect_async(url.as_str())).await;
                let ws = match connected {
                    Ok(Ok((ws, _response))) => ws,
                    Ok(Err(e)) => {
                        self.shared.set_state(ConnState::Closed);
                        self.shared.opened.store(false, Ordering::Release);
                        return Err(OutboxError::Connection(e.to_string()));
                    }
                    Err(_) => {
                        self.shared.set_state(ConnState::Closed);
                        self.shared.opened.store(false, Ordering::Release);
                        return Err(OutboxError::Connection(format!(
                            "connect to {url} timed out"
                        )));
                    }
                };
                let shared = self.shared.clone();
                let task = tokio::spawn(run_managed(shared, ws));
                self.shared.tasks.lock().expect("tasks poisoned").push(task);
            }
            Mode::Attached => {
                let starter = self
                    .starter
                    .lock()
                    .expect("starter poisoned")
                    .take()
                    .ok_or_else(|| {
                        OutboxError::TransportInit("attached socket already consumed".into())
                    })?;
                let task = starter(self.shared.clone());
                self.shared.tasks.lock().expect("tasks poisoned").push(task);
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.set_state(ConnState::Closing);
        self.shared.outbound.lock().expect("outbound poisoned").take();
        self.shared.inbound.lock().expect("inbound poisoned").take();

        let tasks = std::mem::take(&mut *self.shared.tasks.lock().expect("tasks poisoned"));
        for task in tasks {
            task.abort();
        }

        self.shared.liveness.reset();
        self.shared.set_state(ConnState::Closed);
    }

    fn is_ready(&self) -> bool {
        self.shared.io_up()
            && self.shared.liveness.handshake_complete()
            && self.shared.liveness.is_live()
    }

    async fn await_ready(&self, deadline: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if self.is_ready() {
                return true;
            }
            if self.shared.closed.load(Ordering::Acquire) {
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
        let tx = self
            .shared
            .outbound
            .lock()
            .expect("outbound poisoned")
            .clone()
            .ok_or(OutboxError::NotConnected)?;

        let text = serde_json::to_string(&env)?;
        tx.send(Message::Text(text))
            .await
            .map_err(|_| OutboxError::NotConnected)?;
        Ok(None)
    }

    fn set_inbound(&self, handler: InboundHandler) {
        *self.shared.inbound.lock().expect("inbound poisoned") = Some(handler);
    }

    fn set_on_disconnect(&self, hook: DisconnectHook) {
        *self.shared.on_disconnect.lock().expect("hook poisoned") = Some(hook);
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            queries: true,
            stream_acks: true,
        }
    }
}
