//! One peer link: negotiation state plus the worker task owning its transport.

use std::sync::Arc;
use std::time::Duration;

use aga_common::{ConnectionId, SessionDescription};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::LiveResult;
use crate::negotiation::{Action, Negotiation, NegotiationRole};
use crate::transport::{
    LocalMedia, MediaTrack, PeerConnector, PeerTransport, TransportEvent, TransportEvents,
};

/// Something that happened on a link, delivered to the session loop.
#[derive(Debug)]
pub struct LinkReport {
    pub peer: ConnectionId,
    pub generation: u64,
    pub body: ReportBody,
}

#[derive(Debug)]
pub enum ReportBody {
    Transport(TransportEvent),
    Outcome(LinkOutcome),
    /// The negotiation deadline of the link passed.
    Timeout,
}

/// Result of a transport operation run by the worker.
#[derive(Debug)]
pub enum LinkOutcome {
    LocalDescription(SessionDescription),
    RemoteApplied,
    Failed(String),
}

/// Handle to the task that owns a link's transport.
///
/// Dropping it tells the task to abandon in-flight work and close the transport.
#[derive(Debug)]
struct LinkWorker {
    commands: mpsc::UnboundedSender<Action>,
    close: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LinkWorker {
    fn spawn(
        connector: Arc<dyn PeerConnector>,
        peer: ConnectionId,
        generation: u64,
        media: LocalMedia,
        reports: mpsc::UnboundedSender<LinkReport>,
    ) -> Self {
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let (close, close_rx) = oneshot::channel();
        let task = tokio::spawn(run_worker(
            connector,
            peer,
            generation,
            media,
            commands_rx,
            close_rx,
            reports,
        ));
        Self {
            commands,
            close: Some(close),
            task: Some(task),
        }
    }

    fn send(&self, action: Action) {
        // A closed worker already reported its failure.
        let _ = self.commands.send(action);
    }

    fn shutdown(&mut self) -> Option<JoinHandle<()>> {
        self.close.take();
        self.task.take()
    }
}

async fn run_worker(
    connector: Arc<dyn PeerConnector>,
    peer: ConnectionId,
    generation: u64,
    media: LocalMedia,
    mut commands: mpsc::UnboundedReceiver<Action>,
    mut close_rx: oneshot::Receiver<()>,
    reports: mpsc::UnboundedSender<LinkReport>,
) {
    let report = |outcome: LinkOutcome| {
        let _ = reports.send(LinkReport {
            peer: peer.clone(),
            generation,
            body: ReportBody::Outcome(outcome),
        });
    };

    let events = TransportEvents::new(peer.clone(), generation, reports.clone());
    let connected = tokio::select! {
        biased;
        _ = &mut close_rx => None,
        res = connector.connect(&peer, events) => Some(res),
    };
    let mut transport = match connected {
        None => return,
        Some(Ok(transport)) => transport,
        Some(Err(e)) => {
            report(LinkOutcome::Failed(e.to_string()));
            return;
        }
    };

    if !media.is_empty() {
        let attached = tokio::select! {
            biased;
            _ = &mut close_rx => None,
            res = transport.add_local_tracks(&media) => Some(res),
        };
        match attached {
            None => {
                close_transport(&peer, transport.as_mut()).await;
                return;
            }
            Some(Err(e)) => {
                report(LinkOutcome::Failed(e.to_string()));
                close_transport(&peer, transport.as_mut()).await;
                return;
            }
            Some(Ok(())) => {}
        }
    }

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut close_rx => None,
            cmd = commands.recv() => cmd,
        };
        let Some(action) = next else { break };

        let result = tokio::select! {
            biased;
            _ = &mut close_rx => None,
            res = execute(&peer, transport.as_mut(), action) => Some(res),
        };
        match result {
            None => break,
            Some(Ok(Some(outcome))) => report(outcome),
            Some(Ok(None)) => {}
            Some(Err(e)) => {
                report(LinkOutcome::Failed(e.to_string()));
                break;
            }
        }
    }

    close_transport(&peer, transport.as_mut()).await;
}

async fn execute(
    peer: &str,
    transport: &mut dyn PeerTransport,
    action: Action,
) -> LiveResult<Option<LinkOutcome>> {
    match action {
        Action::CreateOffer => Ok(Some(LinkOutcome::LocalDescription(
            transport.create_offer().await?,
        ))),
        Action::CreateAnswer => Ok(Some(LinkOutcome::LocalDescription(
            transport.create_answer().await?,
        ))),
        Action::ApplyRemote(desc) => {
            transport.set_remote_description(desc).await?;
            Ok(Some(LinkOutcome::RemoteApplied))
        }
        Action::Rollback => {
            transport.rollback().await?;
            Ok(None)
        }
        Action::AddRemoteCandidate(candidate) => {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Failed to add candidate from {}: {}", peer, e);
            }
            Ok(None)
        }
        other => {
            warn!("Signaling action {:?} reached the transport worker", other);
            Ok(None)
        }
    }
}

async fn close_transport(peer: &str, transport: &mut dyn PeerTransport) {
    if let Err(e) = transport.close().await {
        debug!("Closing transport for {} failed: {}", peer, e);
    }
}

/// A negotiation with a remote participant and the resources it owns.
pub(crate) struct PeerLink {
    pub(crate) generation: u64,
    pub(crate) negotiation: Negotiation,
    pub(crate) remote_tracks: Vec<Arc<dyn MediaTrack>>,
    /// Transport reported connected while the signaling channel was down.
    pub(crate) deferred_connected: bool,
    worker: LinkWorker,
    timer: Option<JoinHandle<()>>,
}

pub(crate) struct LinkSpec {
    pub role: NegotiationRole,
    pub local_id: ConnectionId,
    pub peer: ConnectionId,
    pub generation: u64,
    pub timeout: Duration,
}

impl PeerLink {
    pub(crate) fn spawn(
        spec: LinkSpec,
        connector: Arc<dyn PeerConnector>,
        media: LocalMedia,
        reports: mpsc::UnboundedSender<LinkReport>,
    ) -> Self {
        let LinkSpec {
            role,
            local_id,
            peer,
            generation,
            timeout,
        } = spec;

        let timer = {
            let reports = reports.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = reports.send(LinkReport {
                    peer,
                    generation,
                    body: ReportBody::Timeout,
                });
            })
        };
        let worker = LinkWorker::spawn(connector, peer.clone(), generation, media, reports);

        Self {
            generation,
            negotiation: Negotiation::new(role, local_id, peer),
            remote_tracks: Vec::new(),
            deferred_connected: false,
            worker,
            timer: Some(timer),
        }
    }

    /// Hands transport actions to the worker and returns the signaling ones.
    pub(crate) fn dispatch(&self, actions: Vec<Action>) -> Vec<Action> {
        let mut signaling = Vec::new();
        for action in actions {
            if action.is_signaling() {
                signaling.push(action);
            } else {
                self.worker.send(action);
            }
        }
        signaling
    }

    pub(crate) fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    /// Stops the link. The returned handle completes once the transport is closed.
    pub(crate) fn shutdown(mut self) -> Option<JoinHandle<()>> {
        self.negotiation.close();
        self.cancel_timer();
        self.worker.shutdown()
    }
}

impl Drop for PeerLink {
    fn drop(&mut self) {
        self.cancel_timer();
        self.worker.shutdown();
    }
}
