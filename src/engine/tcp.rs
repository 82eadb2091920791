//! TCP loop strategies
//!
//! Stream send/receive loops over the length-delimited [`FrameCodec`],
//! the request/answer exchange, and the listening accept loop. A
//! server-style engine keeps listening after a client disconnects; the
//! `Equal`/`EqualBidirectional` client topologies do not auto-reconnect
//! -- the caller restarts the engine.
//!
//! With asymmetric security the stream is TLS-wrapped before framing;
//! the frames themselves stay plain (the transport already encrypts).

use crate::core::{FrameCodec, Value};
use crate::engine::LoopCtx;
use crate::mailbox::MessageBox;
use crate::task::{SocketTask, TaskContext};
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

/// Shared handle to the registered task template; cloned per accepted
/// connection so concurrent connections share no mutable state.
pub(crate) type TaskTemplate = Arc<Mutex<Box<dyn SocketTask>>>;

/// Client send loop: drain the outbound box(es) into the connection.
pub(crate) async fn run_client_send<S>(
    ctx: LoopCtx,
    framed: Framed<S, FrameCodec>,
    outbound: Vec<Arc<MessageBox>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, _stream) = framed.split();
    send_half(ctx, sink, outbound).await;
    debug!("TCP send loop finished");
}

/// Client bidirectional loops: one connection, send from the outbound
/// box and receive into the inbound box concurrently. A peer's own
/// enqueued items never appear in its own inbound box.
pub(crate) async fn run_client_bidirectional<S>(
    ctx: LoopCtx,
    framed: Framed<S, FrameCodec>,
    outbound: Arc<MessageBox>,
    inbound: Arc<MessageBox>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = framed.split();
    tokio::join!(
        send_half(ctx.clone(), sink, vec![outbound]),
        receive_half(ctx, stream, vec![inbound]),
    );
    debug!("TCP bidirectional loops finished");
}

/// Client request/answer loop: send one request, await its answer,
/// enqueue the answer on the inbound box. Strictly ordered per
/// connection.
#[instrument(skip_all)]
pub(crate) async fn run_client_send_answer<S>(
    mut ctx: LoopCtx,
    mut framed: Framed<S, FrameCodec>,
    outbound: Arc<MessageBox>,
    inbound: Arc<MessageBox>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let queue_timeout = ctx.config.queue_timeout;
    let answer_timeout = ctx.config.receiver_timeout;

    loop {
        if *ctx.shutdown.borrow() {
            break;
        }

        let request = match outbound.dequeue_with_wait(queue_timeout).await {
            Some(v) => v,
            None => continue,
        };

        let secured = match ctx.encode_outbound(&request) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to marshal request, dropping");
                continue;
            }
        };

        let sent = secured.len() as u64;
        if let Err(e) = framed.send(Bytes::from(secured)).await {
            error!(error = %e, "Request send failed, stopping loop");
            break;
        }
        ctx.metrics.message_sent(sent);

        let answer = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            result = tokio::time::timeout(answer_timeout, framed.next()) => match result {
                Ok(Some(Ok(blob))) => blob,
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Answer framing error, stopping loop");
                    break;
                }
                Ok(None) => {
                    warn!("Connection closed while awaiting answer");
                    break;
                }
                Err(_) => {
                    warn!("No answer within the receiver timeout");
                    continue;
                }
            },
        };

        match ctx.decode_inbound(&answer) {
            Ok(value) => {
                if inbound.try_enqueue(value) {
                    ctx.metrics.message_received(answer.len() as u64);
                } else {
                    warn!("Inbound box full, dropping answer");
                    ctx.metrics.inbound_drop();
                }
            }
            Err(e) => warn!(error = %e, "Discarding undecodable answer"),
        }
    }
    debug!("TCP request/answer loop finished");
}

/// Accept loop. Per accepted connection one handler task is spawned;
/// the loop keeps listening after clients disconnect and ends only on
/// shutdown. TLS handshake failures reject that connection attempt
/// without stopping the listener.
#[instrument(skip_all, fields(answer_mode))]
pub(crate) async fn run_server(
    mut ctx: LoopCtx,
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    inbound: Vec<Arc<MessageBox>>,
    outbound: Option<Arc<MessageBox>>,
    task_template: Option<TaskTemplate>,
    answer_mode: bool,
) {
    let active = Arc::new(std::sync::atomic::AtomicU32::new(0));

    loop {
        let (stream, peer) = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Error accepting connection");
                    continue;
                }
            },
        };

        info!(%peer, "Connection accepted");
        active.fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let conn_ctx = ctx.clone();
        let conn_inbound = inbound.clone();
        let conn_outbound = outbound.clone();
        let conn_acceptor = acceptor.clone();
        let conn_task = task_template
            .as_ref()
            .map(|t| match t.lock() {
                Ok(guard) => guard.clone_task(),
                Err(poisoned) => poisoned.into_inner().clone_task(),
            });
        let conn_active = active.clone();

        tokio::spawn(async move {
            let codec = FrameCodec::new(&conn_ctx.config.marshalling);
            let result = match conn_acceptor {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => {
                        handle_connection(
                            conn_ctx,
                            Framed::new(tls_stream, codec),
                            conn_inbound,
                            conn_outbound,
                            conn_task,
                            answer_mode,
                        )
                        .await
                    }
                    Err(e) => {
                        error!(%peer, error = %e, "TLS handshake failed");
                        Ok(())
                    }
                },
                None => {
                    handle_connection(
                        conn_ctx,
                        Framed::new(stream, codec),
                        conn_inbound,
                        conn_outbound,
                        conn_task,
                        answer_mode,
                    )
                    .await
                }
            };

            if let Err(e) = result {
                error!(%peer, error = %e, "Connection error");
            }
            conn_active.fetch_sub(1, std::sync::atomic::Ordering::Relaxed);
            info!(%peer, "Connection closed");
        });
    }
    debug!("TCP accept loop finished");
}

/// Serve one accepted connection until it closes or the engine stops.
async fn handle_connection<S>(
    ctx: LoopCtx,
    framed: Framed<S, FrameCodec>,
    inbound: Vec<Arc<MessageBox>>,
    outbound: Option<Arc<MessageBox>>,
    task: Option<Box<dyn SocketTask>>,
    answer_mode: bool,
) -> crate::error::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if answer_mode {
        let task = task.ok_or(crate::error::CommError::InvalidState(
            crate::error::constants::ERR_NO_TASK,
        ))?;
        serve_answers(ctx, framed, task).await;
        return Ok(());
    }

    match outbound {
        Some(outbound) => {
            let (sink, stream) = framed.split();
            tokio::join!(
                send_half(ctx.clone(), sink, vec![outbound]),
                receive_half(ctx, stream, inbound),
            );
        }
        None => {
            let (_sink, stream) = framed.split();
            receive_half(ctx, stream, inbound).await;
        }
    }
    Ok(())
}

/// Request/answer service loop on one connection: decode the request
/// into the task context, run the cloned task, write the answer back.
async fn serve_answers<S>(
    mut ctx: LoopCtx,
    mut framed: Framed<S, FrameCodec>,
    mut task: Box<dyn SocketTask>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let mut task_ctx = TaskContext::default();

    loop {
        let blob = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            next = framed.next() => match next {
                Some(Ok(blob)) => blob,
                Some(Err(e)) => {
                    error!(error = %e, "Framing error, closing connection");
                    break;
                }
                None => break,
            },
        };

        let request = match ctx.decode_inbound(&blob) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Discarding undecodable request");
                continue;
            }
        };
        ctx.metrics.message_received(blob.len() as u64);

        task_ctx.request = Some(request);
        task_ctx.answer = None;
        if let Err(e) = task.run(&mut task_ctx) {
            error!(error = %e, "Socket task failed, closing connection");
            break;
        }

        let answer = task_ctx.answer.take().unwrap_or(Value::Null);
        let secured = match ctx.encode_outbound(&answer) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to marshal answer, closing connection");
                break;
            }
        };

        let sent = secured.len() as u64;
        if let Err(e) = framed.send(Bytes::from(secured)).await {
            error!(error = %e, "Answer send failed, closing connection");
            break;
        }
        ctx.metrics.message_sent(sent);
        ctx.metrics.answer_served();
    }
}

/// Drain the outbound box(es) into a framed sink until shutdown or
/// error. Multiple boxes are polled round-robin.
async fn send_half<S>(
    ctx: LoopCtx,
    mut sink: SplitSink<Framed<S, FrameCodec>, Bytes>,
    outbound: Vec<Arc<MessageBox>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let queue_timeout = ctx.config.queue_timeout;
    let mut next_box = 0usize;

    loop {
        if *ctx.shutdown.borrow() {
            break;
        }

        let mut value = None;
        for offset in 0..outbound.len() {
            if let Some(v) = outbound[(next_box + offset) % outbound.len()].try_dequeue() {
                next_box = (next_box + offset + 1) % outbound.len();
                value = Some(v);
                break;
            }
        }
        let value = match value {
            Some(v) => v,
            None => match outbound[next_box].dequeue_with_wait(queue_timeout).await {
                Some(v) => v,
                None => {
                    if outbound.iter().all(|b| b.is_closed()) {
                        break;
                    }
                    continue;
                }
            },
        };

        let secured = match ctx.encode_outbound(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to marshal outbound value, dropping");
                continue;
            }
        };

        let sent = secured.len() as u64;
        if let Err(e) = sink.send(Bytes::from(secured)).await {
            error!(error = %e, "TCP send failed, stopping send loop");
            break;
        }
        ctx.metrics.message_sent(sent);
    }
}

/// Fill the inbound box(es) from a framed stream until shutdown, error
/// or end of stream.
async fn receive_half<S>(
    mut ctx: LoopCtx,
    mut stream: SplitStream<Framed<S, FrameCodec>>,
    inbound: Vec<Arc<MessageBox>>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    loop {
        let blob = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            next = stream.next() => match next {
                Some(Ok(blob)) => blob,
                Some(Err(e)) => {
                    error!(error = %e, "Framing error, stopping receive loop");
                    break;
                }
                None => break,
            },
        };

        match ctx.decode_inbound(&blob) {
            Ok(value) => {
                if crate::engine::udp::enqueue_first_free(&inbound, value) {
                    ctx.metrics.message_received(blob.len() as u64);
                } else {
                    warn!("Inbound message box full, dropping newest frame");
                    ctx.metrics.inbound_drop();
                }
            }
            Err(e) => warn!(error = %e, "Discarding undecodable frame"),
        }
    }
}
