//! Mirror synchronization driver
//!
//! Periodic outbound pass: snapshot the dirty fields, encode each pair
//! as one `FieldDelta` frame and enqueue it on the engine's outbound
//! box. With `whole_object` marshalling the pass instead ships the full
//! table as one `Object` frame whenever anything is dirty. A full box
//! re-marks the field (or table) dirty so the update is retried on the
//! next pass instead of being lost. Inbound pass: dequeue decoded
//! `FieldDelta` or `Object` frames and apply them.
//!
//! Bidirectional mirroring runs two independent engines over one
//! `Arc<SharedMemory>`; see the module docs in [`crate::mirror`] for
//! the (unenforced) field-ownership convention.

use crate::config::{CommunicationConfig, POLL_INTERVAL};
use crate::core::Value;
use crate::engine::CommunicationEngine;
use crate::error::{CommError, Result};
use crate::mailbox::MessageBox;
use crate::mirror::SharedMemory;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// One running mirror endpoint: its engines plus the sync loops wired
/// to a shared mirror table.
pub struct MirrorSession {
    memory: Arc<SharedMemory>,
    engines: Vec<Arc<CommunicationEngine>>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl MirrorSession {
    /// Start a sending mirror: local `set_field` calls propagate to the
    /// remote peer.
    #[instrument(skip_all)]
    pub async fn sender(memory: Arc<SharedMemory>, config: CommunicationConfig) -> Result<Self> {
        if !config.transport.is_sender() {
            return Err(CommError::Config(
                "Mirror sender requires a sending transport mode".to_string(),
            ));
        }
        let engine = start_engine(config).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_outbound(
            memory.clone(),
            engine.outbound_box().clone(),
            engine.config().sync_interval,
            engine.config().marshalling.whole_object,
            shutdown_rx,
        ));

        info!("Mirror sender started");
        Ok(Self {
            memory,
            engines: vec![engine],
            shutdown_tx,
            handles: Mutex::new(vec![handle]),
        })
    }

    /// Start a receiving mirror: deltas from the remote peer land in
    /// the local table.
    #[instrument(skip_all)]
    pub async fn receiver(memory: Arc<SharedMemory>, config: CommunicationConfig) -> Result<Self> {
        if config.transport.is_sender() {
            return Err(CommError::Config(
                "Mirror receiver requires a receiving transport mode".to_string(),
            ));
        }
        let engine = start_engine(config).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_inbound(
            memory.clone(),
            engine.inbound_box().clone(),
            engine.config().queue_timeout,
            shutdown_rx,
        ));

        info!("Mirror receiver started");
        Ok(Self {
            memory,
            engines: vec![engine],
            shutdown_tx,
            handles: Mutex::new(vec![handle]),
        })
    }

    /// Start a bidirectional mirror: two independent engines over one
    /// table. Which side may write which field is a caller convention;
    /// concurrent writers to the same field race last-write-wins.
    #[instrument(skip_all)]
    pub async fn bidirectional(
        memory: Arc<SharedMemory>,
        send_config: CommunicationConfig,
        receive_config: CommunicationConfig,
    ) -> Result<Self> {
        if !send_config.transport.is_sender() || receive_config.transport.is_sender() {
            return Err(CommError::Config(
                "Bidirectional mirror requires one sending and one receiving transport mode"
                    .to_string(),
            ));
        }
        let send_engine = start_engine(send_config).await?;
        let receive_engine = start_engine(receive_config).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let out_handle = tokio::spawn(run_outbound(
            memory.clone(),
            send_engine.outbound_box().clone(),
            send_engine.config().sync_interval,
            send_engine.config().marshalling.whole_object,
            shutdown_rx.clone(),
        ));
        let in_handle = tokio::spawn(run_inbound(
            memory.clone(),
            receive_engine.inbound_box().clone(),
            receive_engine.config().queue_timeout,
            shutdown_rx,
        ));

        info!("Bidirectional mirror started");
        Ok(Self {
            memory,
            engines: vec![send_engine, receive_engine],
            shutdown_tx,
            handles: Mutex::new(vec![out_handle, in_handle]),
        })
    }

    pub fn memory(&self) -> &Arc<SharedMemory> {
        &self.memory
    }

    pub fn engines(&self) -> &[Arc<CommunicationEngine>] {
        &self.engines
    }

    /// Stop the sync loops and the underlying engine(s).
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);
        for engine in &self.engines {
            engine.stop().await?;
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
        info!("Mirror session stopped");
        Ok(())
    }
}

async fn start_engine(config: CommunicationConfig) -> Result<Arc<CommunicationEngine>> {
    let engine = Arc::new(CommunicationEngine::new(config)?);
    engine.start().await?;
    Ok(engine)
}

/// Periodic outbound pass over the dirty fields.
async fn run_outbound(
    memory: Arc<SharedMemory>,
    outbound: Arc<MessageBox>,
    interval: Duration,
    whole_object: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        if whole_object {
            // any dirty field ships the full table as one frame
            if let Some(values) = memory.snapshot_if_changed() {
                if !outbound.try_enqueue(Value::Object(values)) {
                    warn!("Outbound box full, re-marking table dirty");
                    memory.mark_all_dirty();
                }
            }
            continue;
        }

        for (index, value) in memory.take_changed(true) {
            let delta = Value::FieldDelta {
                index,
                value: Box::new(value),
            };
            if !outbound.try_enqueue(delta) {
                // retry on the next pass with the field's then-current
                // value
                warn!(index, "Outbound box full, re-marking field dirty");
                if let Err(e) = memory.mark_dirty(index) {
                    warn!(index, error = %e, "Failed to re-mark field dirty");
                }
            }
        }
    }
    debug!("Outbound mirror sync loop finished");
}

/// Apply decoded deltas and object snapshots from the inbound box to
/// the table.
async fn run_inbound(
    memory: Arc<SharedMemory>,
    inbound: Arc<MessageBox>,
    queue_timeout: Duration,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        match inbound.dequeue_with_wait(queue_timeout).await {
            Some(Value::FieldDelta { index, value }) => {
                if let Err(e) = memory.apply_delta(index, *value) {
                    warn!(index, error = %e, "Discarding inapplicable delta");
                }
            }
            Some(Value::Object(values)) => {
                if let Err(e) = memory.apply_object(values) {
                    warn!(error = %e, "Discarding inapplicable object snapshot");
                }
            }
            Some(other) => {
                warn!(tag = other.type_name(), "Discarding non-mirror frame");
            }
            None => {
                if inbound.is_closed() {
                    break;
                }
            }
        }
    }
    debug!("Inbound mirror sync loop finished");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::{Endpoint, TransportMode};
    use crate::core::tag;
    use crate::mirror::{FieldDef, FieldSchema};

    fn schema() -> FieldSchema {
        FieldSchema::new(vec![FieldDef {
            index: 1,
            name: "Counter",
            type_tag: tag::U32,
            default: || Value::U32(0),
        }])
        .unwrap()
    }

    #[tokio::test]
    async fn sender_rejects_receiving_mode() {
        let memory = Arc::new(SharedMemory::from_schema(schema()));
        let config = CommunicationConfig::default_with_overrides(|c| {
            c.transport = TransportMode::UdpReceive;
            c.endpoints = vec![Endpoint::new("127.0.0.1", 4310)];
        });
        assert!(matches!(
            MirrorSession::sender(memory, config).await,
            Err(CommError::Config(_))
        ));
    }

    #[tokio::test]
    async fn receiver_rejects_sending_mode() {
        let memory = Arc::new(SharedMemory::from_schema(schema()));
        let config = CommunicationConfig::default_with_overrides(|c| {
            c.transport = TransportMode::UdpSend;
            c.endpoints = vec![Endpoint::new("127.0.0.1", 4311)];
        });
        assert!(matches!(
            MirrorSession::receiver(memory, config).await,
            Err(CommError::Config(_))
        ));
    }
}
