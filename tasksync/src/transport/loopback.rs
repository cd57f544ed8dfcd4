//! Loopback direct transport for testing.
//!
//! A [`LoopbackNetwork`] is an in-process hub that every participant in a
//! test shares. Links opened through it negotiate with short token payloads,
//! exchange one candidate each, and then deliver payloads straight into the
//! remote endpoint's event channel.
//!
//! Two knobs let tests exercise failure paths:
//! [`suppress_candidates`](LoopbackNetwork::suppress_candidates) stalls every
//! negotiation, and [`sever`](LoopbackNetwork::sever) kills an established
//! link as a transport failure would.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    DirectLink, DirectTransportProvider, LinkEvent, LinkEventKind, LinkId, PeerId, TransportError,
};

const OFFER: &[u8] = b"loopback/offer";
const ANSWER: &[u8] = b"loopback/answer";

#[derive(Debug)]
struct Endpoint {
    link_id: LinkId,
    events: mpsc::UnboundedSender<LinkEvent>,
    local_description: bool,
    remote_description: bool,
    remote_candidate: bool,
    connected: bool,
}

impl Endpoint {
    fn emit(&self, remote: &PeerId, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            link_id: self.link_id,
            remote: remote.clone(),
            kind,
        });
    }
}

#[derive(Debug, Default)]
struct Hub {
    /// Keyed by (local, remote).
    endpoints: HashMap<(PeerId, PeerId), Endpoint>,
    suppress_candidates: bool,
}

/// In-process network shared by every loopback link in a test.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
    rendezvous: Vec<String>,
}

impl LoopbackNetwork {
    /// Creates an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, links never emit local candidates, so no negotiation can
    /// complete.
    pub fn suppress_candidates(&self, suppress: bool) {
        self.hub.lock().suppress_candidates = suppress;
    }

    /// Tears down the link between `a` and `b`, raising an error on both ends.
    ///
    /// Returns `true` if an established link existed.
    pub fn sever(&self, a: &PeerId, b: &PeerId) -> bool {
        let mut hub = self.hub.lock();
        let forward = hub.endpoints.remove(&(a.clone(), b.clone()));
        let backward = hub.endpoints.remove(&(b.clone(), a.clone()));
        drop(hub);

        let mut was_connected = false;
        if let Some(ep) = forward {
            was_connected |= ep.connected;
            ep.emit(b, LinkEventKind::Error("link severed".to_string()));
        }
        if let Some(ep) = backward {
            was_connected |= ep.connected;
            ep.emit(a, LinkEventKind::Error("link severed".to_string()));
        }
        was_connected
    }

    /// Whether the link from `local` to `remote` is established.
    #[must_use]
    pub fn is_connected(&self, local: &PeerId, remote: &PeerId) -> bool {
        self.hub
            .lock()
            .endpoints
            .get(&(local.clone(), remote.clone()))
            .is_some_and(|ep| ep.connected)
    }

    /// Number of open link endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.hub.lock().endpoints.len()
    }
}

impl DirectTransportProvider for LoopbackNetwork {
    type Link = LoopbackLink;

    fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link_id: LinkId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self::Link, TransportError> {
        let endpoint = Endpoint {
            link_id,
            events,
            local_description: false,
            remote_description: false,
            remote_candidate: false,
            connected: false,
        };
        self.hub
            .lock()
            .endpoints
            .insert((local.clone(), remote.clone()), endpoint);
        Ok(LoopbackLink {
            hub: Arc::clone(&self.hub),
            local: local.clone(),
            remote: remote.clone(),
            link_id,
        })
    }

    fn rendezvous_servers(&self) -> &[String] {
        &self.rendezvous
    }
}

/// One end of a loopback link.
#[derive(Debug)]
pub struct LoopbackLink {
    hub: Arc<Mutex<Hub>>,
    local: PeerId,
    remote: PeerId,
    link_id: LinkId,
}

impl LoopbackLink {
    fn key(&self) -> (PeerId, PeerId) {
        (self.local.clone(), self.remote.clone())
    }

    /// Applies `update` to this link's endpoint, then raises `Connected`
    /// if negotiation just completed.
    fn update(&self, update: impl FnOnce(&mut Endpoint)) -> Result<(), TransportError> {
        let mut hub = self.hub.lock();
        let ep = hub
            .endpoints
            .get_mut(&self.key())
            .filter(|ep| ep.link_id == self.link_id)
            .ok_or(TransportError::ConnectionClosed)?;
        update(ep);
        if !ep.connected && ep.local_description && ep.remote_description && ep.remote_candidate
        {
            ep.connected = true;
            ep.emit(&self.remote, LinkEventKind::Connected);
        }
        Ok(())
    }

    fn emit_candidate(&self) {
        let hub = self.hub.lock();
        if hub.suppress_candidates {
            return;
        }
        if let Some(ep) = hub.endpoints.get(&self.key()) {
            let candidate = format!("loopback:{}", self.local).into_bytes();
            ep.emit(&self.remote, LinkEventKind::LocalCandidate(candidate));
        }
    }
}

impl DirectLink for LoopbackLink {
    async fn create_offer(&mut self) -> Result<Vec<u8>, TransportError> {
        self.update(|ep| ep.local_description = true)?;
        self.emit_candidate();
        Ok(OFFER.to_vec())
    }

    async fn accept_offer(&mut self, offer: &[u8]) -> Result<Vec<u8>, TransportError> {
        if offer != OFFER {
            return Err(TransportError::Negotiation("unrecognized offer".to_string()));
        }
        self.update(|ep| {
            ep.local_description = true;
            ep.remote_description = true;
        })?;
        self.emit_candidate();
        Ok(ANSWER.to_vec())
    }

    async fn accept_answer(&mut self, answer: &[u8]) -> Result<(), TransportError> {
        if answer != ANSWER {
            return Err(TransportError::Negotiation("unrecognized answer".to_string()));
        }
        self.update(|ep| ep.remote_description = true)
    }

    async fn add_remote_candidate(&mut self, candidate: &[u8]) -> Result<(), TransportError> {
        let expected = format!("loopback:{}", self.remote);
        if candidate != expected.as_bytes() {
            return Err(TransportError::Negotiation("unrecognized candidate".to_string()));
        }
        self.update(|ep| ep.remote_candidate = true)
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let hub = self.hub.lock();
        let ours = hub
            .endpoints
            .get(&self.key())
            .filter(|ep| ep.link_id == self.link_id && ep.connected);
        let theirs = hub
            .endpoints
            .get(&(self.remote.clone(), self.local.clone()))
            .filter(|ep| ep.connected);
        match (ours, theirs) {
            (Some(_), Some(remote_end)) => {
                remote_end.emit(&self.local, LinkEventKind::Data(payload.to_vec()));
                Ok(())
            }
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    fn close(&mut self) {
        let mut hub = self.hub.lock();
        let owned = hub
            .endpoints
            .get(&self.key())
            .is_some_and(|ep| ep.link_id == self.link_id);
        if !owned {
            return;
        }
        let was_connected = hub
            .endpoints
            .remove(&self.key())
            .is_some_and(|ep| ep.connected);
        // Only a connected remote end was paired with this link.
        if was_connected
            && let Some(remote_end) = hub
                .endpoints
                .get(&(self.remote.clone(), self.local.clone()))
                .filter(|ep| ep.connected)
        {
            remote_end.emit(&self.local, LinkEventKind::Closed);
        }
    }
}
