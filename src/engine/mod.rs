//! # Communication Engine
//!
//! Session orchestrator: resolves the configured transport mode into a
//! concrete socket topology at `start()`, spawns the matching loop
//! strategies, and tears them down on `stop()`.
//!
//! ## Lifecycle
//! `Created -> Started -> Stopped`, one way. `start()` on a started
//! engine and `stop()` on a never-started engine are errors; `stop()`
//! after `stop()` is a no-op. A stopped engine is not restartable; build
//! a fresh one.
//!
//! ## Message boxes
//! Box 0 faces the mode's primary direction. `EqualBidirectional` adds
//! box 1 for the opposite direction (outbound = 0, inbound = 1).
//! `ManyBoxesToOneSocket` multiplexes all configured boxes through the
//! single socket, round-robin on send and first-free on receive.

pub mod metrics;
pub(crate) mod tcp;
pub(crate) mod udp;

pub use metrics::{EngineMetrics, MetricsSnapshot};

use crate::config::{
    Cardinality, CommunicationConfig, SecurityMode, TransportMode, POLL_INTERVAL,
};
use crate::core::{FrameCodec, Marshaller, Value};
use crate::error::{constants, CommError, Result};
use crate::mailbox::MessageBox;
use crate::security::{build_envelope, Envelope};
use crate::task::{TaskContext, TaskSpec};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, info, instrument, warn};

const STATE_CREATED: u8 = 0;
const STATE_STARTED: u8 = 1;
const STATE_STOPPED: u8 = 2;

/// Everything a spawned loop needs, cloned per loop. The marshaller and
/// envelope are built once at `start()` so the KDF cost is paid up
/// front.
#[derive(Clone)]
pub(crate) struct LoopCtx {
    pub config: Arc<CommunicationConfig>,
    pub marshaller: Marshaller,
    pub envelope: Arc<dyn Envelope>,
    pub metrics: Arc<EngineMetrics>,
    pub shutdown: watch::Receiver<bool>,
}

impl LoopCtx {
    /// Marshal (or pass through raw bytes) and secure one outbound
    /// value.
    pub fn encode_outbound(&self, value: &Value) -> Result<Vec<u8>> {
        let frame = if self.config.marshalling.enabled {
            self.marshaller.encode(value)?
        } else {
            match value {
                Value::Bytes(raw) => raw.clone(),
                other => {
                    return Err(CommError::Marshal(format!(
                        "Marshalling is disabled; only raw Bytes values can be sent, got {}",
                        other.type_name()
                    )))
                }
            }
        };
        self.envelope.wrap(&frame)
    }

    /// Unwrap and unmarshal one inbound frame. With marshalling
    /// disabled the recovered frame surfaces as a raw `Bytes` value.
    pub fn decode_inbound(&self, secured: &[u8]) -> Result<Value> {
        let frame = self.envelope.unwrap(secured)?;
        if self.config.marshalling.enabled {
            self.marshaller.decode(&frame)
        } else {
            Ok(Value::Bytes(frame))
        }
    }
}

/// One point-to-point communication session: config in, message boxes
/// out. All sockets, loops and key material live behind `start()` /
/// `stop()`.
pub struct CommunicationEngine {
    config: Arc<CommunicationConfig>,
    state: AtomicU8,
    boxes: Vec<Arc<MessageBox>>,
    task: Mutex<Option<TaskSpec>>,
    metrics: Arc<EngineMetrics>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl CommunicationEngine {
    /// Build an engine from a validated configuration. Message boxes
    /// are allocated here so callers can enqueue before `start()`.
    pub fn new(config: CommunicationConfig) -> Result<Self> {
        config.validate_strict()?;

        let boxes = config
            .box_lengths
            .iter()
            .map(|len| Arc::new(MessageBox::new(*len)))
            .collect();

        Ok(Self {
            config: Arc::new(config),
            state: AtomicU8::new(STATE_CREATED),
            boxes,
            task: Mutex::new(None),
            metrics: Arc::new(EngineMetrics::new()),
            shutdown_tx: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Builder-style task registration
    pub fn with_task(self, spec: TaskSpec) -> Self {
        self.register_task(spec);
        self
    }

    /// Register the socket task before `start()`. Answer transports
    /// require one; sender transports may use a periodic one.
    pub fn register_task(&self, spec: TaskSpec) {
        let mut slot = match self.task.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(spec);
    }

    /// All message boxes, in configuration order
    pub fn boxes(&self) -> &[Arc<MessageBox>] {
        &self.boxes
    }

    /// The box callers enqueue into on sending modes (box 0)
    pub fn outbound_box(&self) -> &Arc<MessageBox> {
        &self.boxes[0]
    }

    /// The box callers dequeue from. Box 1 under `EqualBidirectional`
    /// and for answer exchanges; box 0 otherwise.
    pub fn inbound_box(&self) -> &Arc<MessageBox> {
        if self.config.cardinality == Cardinality::EqualBidirectional {
            &self.boxes[1]
        } else {
            &self.boxes[0]
        }
    }

    pub fn config(&self) -> &CommunicationConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_STARTED
    }

    /// Resolve the topology, open sockets, derive key material and
    /// spawn the loop strategies.
    #[instrument(skip(self), fields(transport = ?self.config.transport))]
    pub async fn start(&self) -> Result<()> {
        if self
            .state
            .compare_exchange(
                STATE_CREATED,
                STATE_STARTED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(CommError::InvalidState(constants::ERR_ALREADY_STARTED));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = LoopCtx {
            config: self.config.clone(),
            marshaller: Marshaller::new(&self.config.marshalling)?,
            envelope: build_envelope(&self.config.security)?,
            metrics: self.metrics.clone(),
            shutdown: shutdown_rx,
        };

        let mut handles = Vec::new();
        let setup = match self.config.transport {
            TransportMode::UdpSend
            | TransportMode::UdpSendAck
            | TransportMode::UdpMulticastSend => self.start_udp_sender(&ctx, &mut handles).await,
            TransportMode::UdpReceive
            | TransportMode::UdpReceiveAck
            | TransportMode::UdpMulticastReceive => {
                self.start_udp_receiver(&ctx, &mut handles).await
            }
            TransportMode::TcpSend | TransportMode::TcpSendAnswer => {
                self.start_tcp_client(&ctx, &mut handles).await
            }
            TransportMode::TcpReceive | TransportMode::TcpReceiveAnswer => {
                self.start_tcp_server(&ctx, &mut handles).await
            }
        };
        if let Err(e) = setup {
            // abort anything already spawned and land in the terminal
            // state rather than half-started
            self.state.store(STATE_STOPPED, Ordering::Release);
            for handle in handles {
                handle.abort();
            }
            return Err(e);
        }

        self.spawn_periodic_task(&ctx, &mut handles);

        match self.shutdown_tx.lock() {
            Ok(mut guard) => *guard = Some(shutdown_tx),
            Err(poisoned) => *poisoned.into_inner() = Some(shutdown_tx),
        }
        match self.handles.lock() {
            Ok(mut guard) => guard.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }

        info!(
            cardinality = ?self.config.cardinality,
            boxes = self.boxes.len(),
            "Communication engine started"
        );
        Ok(())
    }

    /// Signal the loops, close the boxes, give in-flight work two poll
    /// intervals to drain, then abort whatever is left. Idempotent once
    /// started.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        match self.state.compare_exchange(
            STATE_STARTED,
            STATE_STOPPED,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(STATE_STOPPED) => return Ok(()),
            Err(_) => return Err(CommError::InvalidState(constants::ERR_NOT_STARTED)),
        }

        let tx = match self.shutdown_tx.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(tx) = tx {
            let _ = tx.send(true);
        }
        for mbox in &self.boxes {
            mbox.close();
        }

        tokio::time::sleep(2 * POLL_INTERVAL).await;

        let handles = match self.handles.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for handle in handles {
            if !handle.is_finished() {
                handle.abort();
            }
        }

        info!("Communication engine stopped");
        Ok(())
    }

    async fn start_udp_sender(
        &self,
        ctx: &LoopCtx,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let remote = resolve(&self.config.remote_address()?).await?;
        let socket = Arc::new(UdpSocket::bind(self.config.bind_address()).await?);
        if self.config.transport == TransportMode::UdpMulticastSend {
            udp::set_multicast_ttl(&socket, remote, self.config.multicast_ttl)?;
        }
        debug!(local = ?socket.local_addr().ok(), %remote, "UDP sender socket bound");

        let with_ack = self.config.transport.uses_ack();
        let (out_boxes, in_box) = self.split_directional();
        handles.push(tokio::spawn(udp::run_send(
            ctx.clone(),
            socket.clone(),
            remote,
            out_boxes,
            with_ack,
        )));
        if let Some(in_box) = in_box {
            handles.push(tokio::spawn(udp::run_receive(
                ctx.clone(),
                socket,
                vec![in_box],
                false,
            )));
        }
        Ok(())
    }

    async fn start_udp_receiver(
        &self,
        ctx: &LoopCtx,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let socket = Arc::new(UdpSocket::bind(self.config.bind_address()).await?);
        if self.config.transport == TransportMode::UdpMulticastReceive {
            let group: IpAddr = self
                .config
                .endpoints
                .first()
                .ok_or_else(|| CommError::Config("No endpoint configured".to_string()))?
                .host
                .parse()
                .map_err(|e| {
                    CommError::Config(format!("Multicast group must be an IP literal: {e}"))
                })?;
            udp::join_multicast(&socket, group)?;
            debug!(%group, "Joined multicast group");
        }
        debug!(local = ?socket.local_addr().ok(), "UDP receiver socket bound");

        let with_ack = self.config.transport.uses_ack();
        match self.config.cardinality {
            Cardinality::EqualBidirectional => {
                // Receive into box 1, reply from box 0 to the remote
                let remote = resolve(&self.config.remote_address()?).await?;
                handles.push(tokio::spawn(udp::run_receive(
                    ctx.clone(),
                    socket.clone(),
                    vec![self.boxes[1].clone()],
                    with_ack,
                )));
                handles.push(tokio::spawn(udp::run_send(
                    ctx.clone(),
                    socket,
                    remote,
                    vec![self.boxes[0].clone()],
                    false,
                )));
            }
            _ => {
                handles.push(tokio::spawn(udp::run_receive(
                    ctx.clone(),
                    socket,
                    self.boxes.clone(),
                    with_ack,
                )));
            }
        }
        Ok(())
    }

    async fn start_tcp_client(
        &self,
        ctx: &LoopCtx,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let remote = self.config.remote_address()?;
        let stream = TcpStream::connect(&remote).await?;
        stream.set_nodelay(true)?;
        debug!(%remote, "TCP connection established");

        let codec = FrameCodec::new(&self.config.marshalling);
        if let SecurityMode::Asymmetric(tls) = &self.config.security {
            let host = self
                .config
                .endpoints
                .first()
                .map(|e| e.host.clone())
                .unwrap_or_default();
            let (connector, server_name) = tls.connector(&host)?;
            let tls_stream = connector
                .connect(server_name, stream)
                .await
                .map_err(|e| CommError::AuthenticationFailure(format!("TLS handshake: {e}")))?;
            debug!(%remote, "TLS handshake completed");
            handles.push(self.spawn_client_loops(ctx, Framed::new(tls_stream, codec)));
        } else {
            handles.push(self.spawn_client_loops(ctx, Framed::new(stream, codec)));
        }
        Ok(())
    }

    fn spawn_client_loops<S>(&self, ctx: &LoopCtx, framed: Framed<S, FrameCodec>) -> JoinHandle<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let ctx = ctx.clone();
        match self.config.transport {
            TransportMode::TcpSendAnswer => {
                // Validation pinned this to EqualBidirectional
                let outbound = self.boxes[0].clone();
                let inbound = self.boxes[1].clone();
                tokio::spawn(tcp::run_client_send_answer(ctx, framed, outbound, inbound))
            }
            _ => match self.config.cardinality {
                Cardinality::EqualBidirectional => {
                    let outbound = self.boxes[0].clone();
                    let inbound = self.boxes[1].clone();
                    tokio::spawn(tcp::run_client_bidirectional(ctx, framed, outbound, inbound))
                }
                _ => tokio::spawn(tcp::run_client_send(ctx, framed, self.boxes.clone())),
            },
        }
    }

    async fn start_tcp_server(
        &self,
        ctx: &LoopCtx,
        handles: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let listener = TcpListener::bind(self.config.bind_address()).await?;
        debug!(local = ?listener.local_addr().ok(), "TCP listener bound");

        let acceptor = match &self.config.security {
            SecurityMode::Asymmetric(tls) => Some(tls.acceptor()?),
            _ => None,
        };

        let answer_mode = self.config.transport == TransportMode::TcpReceiveAnswer;
        let task_template: Option<tcp::TaskTemplate> = if answer_mode {
            let spec = {
                let mut slot = match self.task.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                slot.take()
            };
            let spec =
                spec.ok_or(CommError::InvalidState(constants::ERR_NO_TASK))?;
            Some(Arc::new(Mutex::new(spec.task)))
        } else {
            None
        };

        let (inbound, outbound) = match self.config.cardinality {
            Cardinality::EqualBidirectional => {
                (vec![self.boxes[1].clone()], Some(self.boxes[0].clone()))
            }
            _ => (self.boxes.clone(), None),
        };

        handles.push(tokio::spawn(tcp::run_server(
            ctx.clone(),
            listener,
            acceptor,
            inbound,
            outbound,
            task_template,
            answer_mode,
        )));
        Ok(())
    }

    /// Outbound boxes plus the optional opposite-direction box for the
    /// primary sending modes.
    fn split_directional(&self) -> (Vec<Arc<MessageBox>>, Option<Arc<MessageBox>>) {
        match self.config.cardinality {
            Cardinality::EqualBidirectional => {
                (vec![self.boxes[0].clone()], Some(self.boxes[1].clone()))
            }
            _ => (self.boxes.clone(), None),
        }
    }

    /// Drive a registered periodic task: run, enqueue its answer on the
    /// outbound box, sleep the interval. Non-periodic specs stay in the
    /// slot for the answer transports.
    fn spawn_periodic_task(&self, ctx: &LoopCtx, handles: &mut Vec<JoinHandle<()>>) {
        let spec = {
            let mut slot = match self.task.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match &*slot {
                Some(spec) if spec.endless => slot.take(),
                _ => None,
            }
        };
        let Some(spec) = spec else { return };

        let mut ctx = ctx.clone();
        let outbound = self.boxes[0].clone();
        let interval = std::time::Duration::from_millis(spec.interval_ms.max(1));
        let mut task = spec.task;

        handles.push(tokio::spawn(async move {
            let mut task_ctx = TaskContext::default();
            loop {
                tokio::select! {
                    _ = ctx.shutdown.changed() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                task_ctx.request = None;
                task_ctx.answer = None;
                if let Err(e) = task.run(&mut task_ctx) {
                    warn!(error = %e, "Periodic task failed, stopping its loop");
                    break;
                }
                if let Some(answer) = task_ctx.answer.take() {
                    if !outbound.try_enqueue(answer) {
                        warn!("Outbound box full, dropping periodic task output");
                    }
                }
            }
            debug!("Periodic task loop finished");
        }));
    }
}

impl std::fmt::Debug for CommunicationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommunicationEngine")
            .field("transport", &self.config.transport)
            .field("cardinality", &self.config.cardinality)
            .field("state", &self.state.load(Ordering::Relaxed))
            .field("boxes", &self.boxes.len())
            .finish()
    }
}

/// Resolve a `host:port` string to its first socket address.
async fn resolve(address: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(address)
        .await?
        .next()
        .ok_or_else(|| CommError::Transport(format!("Address did not resolve: {address}")))
}
