//! Transport registry
//!
//! The manager task is the sole owner of every live subscriber
//! transport. Additions come from the signaling surface; removals
//! are posted by the transports themselves when they shut down.
//! Removing a transport deregisters it from its media source, stops
//! its loop and waits for it before dropping the handle.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::transport::WebrtcTransport;
use crate::media::MediaSourceManager;

/// Commands processed on the manager task.
pub enum ManagerCommand {
    Add(Arc<WebrtcTransport>),
    Remove(u64),
    Shutdown,
}

pub struct TransportManager {
    command_tx: mpsc::Sender<ManagerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransportManager {
    /// Spawn the registry task.
    pub fn start(sources: Arc<MediaSourceManager>) -> Arc<Self> {
        let (command_tx, mut command_rx) = mpsc::channel(64);
        let worker = tokio::spawn(async move {
            let mut transports: HashMap<u64, Arc<WebrtcTransport>> = HashMap::new();
            while let Some(command) = command_rx.recv().await {
                match command {
                    ManagerCommand::Add(transport) => {
                        debug!(id = transport.id(), "transport registered");
                        transports.insert(transport.id(), transport);
                    }
                    ManagerCommand::Remove(id) => {
                        let Some(transport) = transports.remove(&id) else {
                            warn!(id, "transport to remove is not registered");
                            continue;
                        };
                        if let Some(source) = sources.query(transport.stream_id()) {
                            source.deregister_observer(id);
                        }
                        transport.stop().await;
                        debug!(live = transports.len(), "transport removed");
                    }
                    ManagerCommand::Shutdown => {
                        for (id, transport) in transports.drain() {
                            if let Some(source) = sources.query(transport.stream_id()) {
                                source.deregister_observer(id);
                            }
                            transport.stop().await;
                        }
                        break;
                    }
                }
            }
        });

        Arc::new(Self {
            command_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Sender handed to transports so they can post their removal.
    pub fn command_sender(&self) -> mpsc::Sender<ManagerCommand> {
        self.command_tx.clone()
    }

    /// Register a freshly created transport.
    pub async fn add(&self, transport: Arc<WebrtcTransport>) {
        let _ = self.command_tx.send(ManagerCommand::Add(transport)).await;
    }

    /// Stop every transport and the registry task itself.
    pub async fn stop(&self) {
        let _ = self.command_tx.send(ManagerCommand::Shutdown).await;
        if let Some(worker) = self.worker.lock().await.take() {
            let _ = worker.await;
        }
    }
}
