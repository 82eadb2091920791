//! UDP loop strategies
//!
//! Datagram send/receive loops, the ACK sub-protocol and multicast
//! group handling. The ACK sub-protocol is an application-level
//! acknowledgment: the receiver replies to the sender's source address
//! with a one-byte datagram immediately upon receipt; the sender
//! retransmits on a missed ACK window until the overall sender timeout
//! budget is exhausted, then drops the message with a warning. A
//! dropped message is not fatal to the engine.

use crate::config::ACK_BYTE;
use crate::engine::LoopCtx;
use crate::mailbox::MessageBox;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, instrument, warn};

/// Largest datagram the receive loop accepts
const MAX_DATAGRAM: usize = 64 * 1024;

/// Join the multicast group matching the remote address family.
pub(crate) fn join_multicast(socket: &UdpSocket, group: IpAddr) -> crate::error::Result<()> {
    match group {
        IpAddr::V4(addr) => socket.join_multicast_v4(addr, Ipv4Addr::UNSPECIFIED)?,
        IpAddr::V6(addr) => socket.join_multicast_v6(&addr, 0)?,
    }
    Ok(())
}

/// Set the multicast TTL / hop limit for a sending socket. The socket
/// API carries no IPv6 hop-limit setter, so for IPv6 groups the OS
/// default applies and the configured value is reported as skipped.
pub(crate) fn set_multicast_ttl(
    socket: &UdpSocket,
    remote: SocketAddr,
    ttl: u32,
) -> crate::error::Result<()> {
    match remote.ip() {
        IpAddr::V4(_) => socket.set_multicast_ttl_v4(ttl)?,
        IpAddr::V6(_) => {
            warn!(ttl, "Multicast hop limit is not applied to IPv6 groups; the OS default applies");
        }
    }
    Ok(())
}

/// Drain the outbound boxes into the socket. Boxes are polled
/// round-robin so `ManyBoxesToOneSocket` multiplexes fairly.
#[instrument(skip_all, fields(remote = %remote, with_ack))]
pub(crate) async fn run_send(
    mut ctx: LoopCtx,
    socket: Arc<UdpSocket>,
    remote: SocketAddr,
    boxes: Vec<Arc<MessageBox>>,
    with_ack: bool,
) {
    let queue_timeout = ctx.config.queue_timeout;
    let mut next_box = 0usize;

    loop {
        if *ctx.shutdown.borrow() {
            break;
        }

        // Round-robin over the outbound boxes; fall back to the wait
        // loop on the current one so shutdown stays responsive
        let mut value = None;
        for offset in 0..boxes.len() {
            if let Some(v) = boxes[(next_box + offset) % boxes.len()].try_dequeue() {
                next_box = (next_box + offset + 1) % boxes.len();
                value = Some(v);
                break;
            }
        }
        let value = match value {
            Some(v) => v,
            None => match boxes[next_box].dequeue_with_wait(queue_timeout).await {
                Some(v) => v,
                None => continue,
            },
        };

        let secured = match ctx.encode_outbound(&value) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(error = %e, "Failed to marshal outbound value, dropping");
                continue;
            }
        };

        if with_ack {
            send_with_ack(&mut ctx, &socket, remote, &secured).await;
        } else {
            match socket.send_to(&secured, remote).await {
                Ok(n) => ctx.metrics.message_sent(n as u64),
                Err(e) => {
                    error!(error = %e, "UDP send failed, stopping send loop");
                    break;
                }
            }
        }
    }
    debug!("UDP send loop finished");
}

/// Transmit one datagram under the ACK sub-protocol: resend on every
/// missed ACK window until the sender timeout budget runs out.
async fn send_with_ack(ctx: &mut LoopCtx, socket: &UdpSocket, remote: SocketAddr, secured: &[u8]) {
    let budget = ctx.config.sender_timeout;
    let ack_window = ctx.config.udp_ack_timeout;
    let start = Instant::now();
    let mut ack_buf = [0u8; 8];
    let mut attempts = 0u32;

    while start.elapsed() < budget {
        if *ctx.shutdown.borrow() {
            return;
        }

        if attempts > 0 {
            ctx.metrics.ack_retransmit();
        }
        attempts += 1;

        let sent = match socket.send_to(secured, remote).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, attempt = attempts, "UDP send failed during ACK cycle");
                continue;
            }
        };

        // a stray non-ACK datagram must not cut the window short: keep
        // receiving until the ACK arrives or the window deadline passes
        let window_end = Instant::now() + ack_window;
        loop {
            match timeout_at(window_end, socket.recv_from(&mut ack_buf)).await {
                Ok(Ok((n, src))) if n >= 1 && ack_buf[0] == ACK_BYTE => {
                    debug!(%src, attempts, "Datagram acknowledged");
                    ctx.metrics.message_sent(sent as u64);
                    return;
                }
                Ok(Ok((_, src))) => {
                    debug!(%src, "Ignoring non-ACK datagram during ACK wait");
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "ACK receive failed");
                    break;
                }
                Err(_) => break, // window elapsed, resend
            }
        }
    }

    warn!(
        attempts,
        budget_ms = budget.as_millis() as u64,
        "No ACK within the sender timeout budget, dropping message"
    );
    ctx.metrics.ack_failure();
}

/// Receive datagrams, unwrap/unmarshal and enqueue them. With ACK the
/// acknowledgment datagram goes back to the sender's source address
/// before the frame is enqueued. A full inbound box drops the newest
/// datagram with a warning, pushing backpressure onto the network peer.
#[instrument(skip_all, fields(with_ack))]
pub(crate) async fn run_receive(
    mut ctx: LoopCtx,
    socket: Arc<UdpSocket>,
    boxes: Vec<Arc<MessageBox>>,
    with_ack: bool,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        let (n, src) = tokio::select! {
            _ = ctx.shutdown.changed() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "UDP receive failed, stopping receive loop");
                    break;
                }
            },
        };

        if with_ack {
            if let Err(e) = socket.send_to(&[ACK_BYTE], src).await {
                warn!(error = %e, %src, "Failed to send ACK datagram");
            }
        }

        let value = match ctx.decode_inbound(&buf[..n]) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, %src, "Discarding undecodable datagram");
                continue;
            }
        };

        if enqueue_first_free(&boxes, value) {
            ctx.metrics.message_received(n as u64);
        } else {
            warn!(%src, "Inbound message box full, dropping newest datagram");
            ctx.metrics.inbound_drop();
        }
    }
    debug!("UDP receive loop finished");
}

/// Enqueue into the first box with free capacity.
pub(crate) fn enqueue_first_free(boxes: &[Arc<MessageBox>], value: crate::core::Value) -> bool {
    if boxes.len() == 1 {
        return boxes[0].try_enqueue(value);
    }
    for mbox in boxes {
        if mbox.try_enqueue(value.clone()) {
            return true;
        }
    }
    false
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multicast_ttl_applies_per_address_family() {
        let v4 = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        set_multicast_ttl(&v4, "224.0.0.251:5353".parse().unwrap(), 4).unwrap();
        assert_eq!(v4.multicast_ttl_v4().unwrap(), 4);

        // IPv6 has no hop-limit setter; the call must warn and stay non-fatal
        let v6 = UdpSocket::bind("[::1]:0").await.unwrap();
        set_multicast_ttl(&v6, "[ff02::fb]:5353".parse().unwrap(), 4).unwrap();
    }
}
