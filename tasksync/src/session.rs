//! Peer session manager: one negotiation state machine per remote peer.
//!
//! The manager owns the session table for the local connection. Room
//! membership from the relay drives intent (`room-peers`, `peer-joined`,
//! `peer-left`); negotiation envelopes drive the offer/answer exchange; and
//! [`LinkEvent`]s from the direct transport drive connectivity.
//!
//! ```text
//!  Idle ──intent, local < remote──▶ Negotiating{initiator: true}
//!  Idle ──offer received─────────▶ Negotiating{initiator: false}
//!  Negotiating ──link connected──▶ Connected
//!  any ──peer-left / failure / timeout / local leave──▶ closed (removed)
//! ```
//!
//! Only the side with the lexicographically smaller connection id acts on
//! intent. Everything observable comes out as [`SessionUpdate`]s, drained by
//! the event loop after each call.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use tasksync_proto::relay::{Negotiation, RelayMessage};

use crate::transport::relay::RelayOutbound;
use crate::transport::{
    DirectLink, DirectTransportProvider, LinkEvent, LinkEventKind, LinkId, PeerId, TransportError,
};

/// Default time a session may spend negotiating before it is closed.
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Default number of offers the initiator makes before giving up.
pub const DEFAULT_MAX_NEGOTIATION_ATTEMPTS: u32 = 3;

/// Tunables for session negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    /// How long a session may stay in `Negotiating`.
    pub negotiation_timeout: Duration,
    /// Offers made to one peer before falling back to relay-only sync.
    pub max_negotiation_attempts: u32,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            max_negotiation_attempts: DEFAULT_MAX_NEGOTIATION_ATTEMPTS,
        }
    }
}

/// Negotiation state of the session with one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session exists.
    Idle,
    /// Offer/answer exchange in progress.
    Negotiating {
        /// Whether the local side sent the offer.
        initiator: bool,
    },
    /// The direct link is up.
    Connected,
}

/// Why a session was closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The remote left the room or disconnected.
    PeerLeft,
    /// The local side left the room or is shutting down.
    LocalLeave,
    /// Negotiation did not finish before the deadline.
    NegotiationTimeout,
    /// The direct link failed or closed.
    TransportError(String),
    /// A fresh offer from the remote replaced this session.
    Superseded,
    /// The remote's negotiation payload was rejected.
    NegotiationFailed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerLeft => write!(f, "peer left"),
            Self::LocalLeave => write!(f, "local leave"),
            Self::NegotiationTimeout => write!(f, "negotiation timed out"),
            Self::TransportError(e) => write!(f, "transport error: {e}"),
            Self::Superseded => write!(f, "superseded by a new offer"),
            Self::NegotiationFailed(e) => write!(f, "negotiation failed: {e}"),
        }
    }
}

/// Something the event loop should react to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    /// A direct link to `peer` came up.
    Connected(PeerId),
    /// The session with `peer` ended and was removed.
    Closed {
        /// The remote peer.
        peer: PeerId,
        /// Why it ended.
        reason: CloseReason,
    },
    /// `peer` sent a payload over the direct link.
    Frame {
        /// The remote peer.
        peer: PeerId,
        /// Raw payload, normally an encoded `PeerFrame`.
        payload: Vec<u8>,
    },
}

/// Errors from session operations. None of them are fatal to sync; the
/// relay path keeps working.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A negotiation message arrived for a peer with no session.
    #[error("no session with peer {0}")]
    NoSession(PeerId),

    /// An answer arrived for a session that did not send an offer.
    #[error("unexpected answer from peer {0}")]
    UnexpectedAnswer(PeerId),

    /// An offer arrived from a connection outside the current room.
    #[error("offer from non-member {0}")]
    NotMember(PeerId),

    /// The direct transport or the relay rejected an operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

struct Session<L> {
    link: L,
    link_id: LinkId,
    state: SessionState,
    deadline: Instant,
}

/// Owns every peer session of the local connection.
pub struct PeerSessionManager<P: DirectTransportProvider> {
    local: PeerId,
    provider: P,
    relay: RelayOutbound,
    settings: SessionSettings,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    sessions: HashMap<PeerId, Session<P::Link>>,
    /// Current room members, excluding the local connection.
    members: BTreeSet<PeerId>,
    /// Offers made per peer since the last success or fresh join.
    attempts: HashMap<PeerId, u32>,
    next_link: u64,
    updates: Vec<SessionUpdate>,
}

impl<P: DirectTransportProvider> PeerSessionManager<P> {
    /// Creates a manager for the connection `local`.
    ///
    /// Returns the receiving half of the link event channel; feed every
    /// event from it into [`handle_link_event`](Self::handle_link_event).
    pub fn new(
        local: PeerId,
        provider: P,
        relay: RelayOutbound,
        settings: SessionSettings,
    ) -> (Self, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        tracing::debug!(
            local = %local,
            rendezvous = ?provider.rendezvous_servers(),
            "peer session manager ready"
        );
        let manager = Self {
            local,
            provider,
            relay,
            settings,
            events_tx,
            sessions: HashMap::new(),
            members: BTreeSet::new(),
            attempts: HashMap::new(),
            next_link: 0,
            updates: Vec::new(),
        };
        (manager, events_rx)
    }

    /// The local connection id.
    #[must_use]
    pub const fn local_id(&self) -> &PeerId {
        &self.local
    }

    /// Current state of the session with `peer`.
    #[must_use]
    pub fn state(&self, peer: &PeerId) -> SessionState {
        self.sessions.get(peer).map_or(SessionState::Idle, |s| s.state)
    }

    /// Peers with an established direct link, sorted.
    #[must_use]
    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.state == SessionState::Connected)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Number of established direct links.
    #[must_use]
    pub fn connected_count(&self) -> usize {
        self.sessions
            .values()
            .filter(|s| s.state == SessionState::Connected)
            .count()
    }

    /// Number of sessions in any state.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Number of other room members.
    #[must_use]
    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    /// Takes the updates accumulated since the last call.
    pub fn drain_updates(&mut self) -> Vec<SessionUpdate> {
        std::mem::take(&mut self.updates)
    }

    /// Handles the relay's reply to a join: the full member list.
    pub async fn on_room_peers(&mut self, peers: &[PeerId]) {
        self.members = peers
            .iter()
            .filter(|p| **p != self.local)
            .cloned()
            .collect();
        self.attempts.clear();
        let members: Vec<PeerId> = self.members.iter().cloned().collect();
        for peer in members {
            self.connect_if_initiator(&peer).await;
        }
    }

    /// Handles a new member joining the room.
    pub async fn on_peer_joined(&mut self, peer: PeerId) {
        if peer == self.local {
            return;
        }
        self.attempts.remove(&peer);
        self.members.insert(peer.clone());
        self.connect_if_initiator(&peer).await;
    }

    /// Handles a member leaving the room or disconnecting.
    pub fn on_peer_left(&mut self, peer: &PeerId) {
        self.members.remove(peer);
        self.attempts.remove(peer);
        self.close_session(peer, CloseReason::PeerLeft);
    }

    /// Handles an offer relayed from `offer.from`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NotMember`] if the sender is not in the current
    ///   room, e.g. a late offer from a room this side already left. The
    ///   offer is dropped.
    /// - [`SessionError::Transport`] if the link rejects the offer or the
    ///   answer cannot be queued to the relay.
    pub async fn on_offer(&mut self, offer: Negotiation) -> Result<(), SessionError> {
        let remote = PeerId::new(offer.from);
        if remote == self.local {
            return Ok(());
        }
        if !self.members.contains(&remote) {
            tracing::debug!(peer = %remote, "dropping offer from non-member");
            return Err(SessionError::NotMember(remote));
        }
        if let Some(existing) = self.sessions.get(&remote) {
            let designated = self.local < remote;
            if designated && existing.state == (SessionState::Negotiating { initiator: true }) {
                tracing::debug!(peer = %remote, "ignoring offer, local offer takes precedence");
                return Ok(());
            }
            self.close_session(&remote, CloseReason::Superseded);
        }

        let link_id = self.next_link_id();
        let mut link = self
            .provider
            .open(&self.local, &remote, link_id, self.events_tx.clone())?;
        let answer = match link.accept_offer(&offer.payload).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::warn!(peer = %remote, error = %e, "rejected offer");
                link.close();
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .relay
            .send(RelayMessage::Answer(Negotiation::to(remote.as_str(), answer)))
        {
            link.close();
            return Err(e.into());
        }

        tracing::debug!(peer = %remote, %link_id, "answered offer");
        self.sessions.insert(
            remote,
            Session {
                link,
                link_id,
                state: SessionState::Negotiating { initiator: false },
                deadline: Instant::now() + self.settings.negotiation_timeout,
            },
        );
        Ok(())
    }

    /// Handles an answer relayed from `answer.from`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::UnexpectedAnswer`] if there is no session that
    ///   sent an offer to this peer. The answer is dropped.
    /// - [`SessionError::Transport`] if the link rejects the answer; the
    ///   session is closed.
    pub async fn on_answer(&mut self, answer: Negotiation) -> Result<(), SessionError> {
        let remote = PeerId::new(answer.from);
        let Some(session) = self
            .sessions
            .get_mut(&remote)
            .filter(|s| s.state == SessionState::Negotiating { initiator: true })
        else {
            tracing::debug!(peer = %remote, "dropping unexpected answer");
            return Err(SessionError::UnexpectedAnswer(remote));
        };

        let result = session.link.accept_answer(&answer.payload).await;
        if let Err(e) = result {
            tracing::warn!(peer = %remote, error = %e, "rejected answer");
            self.close_session(&remote, CloseReason::NegotiationFailed(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Handles a connectivity candidate relayed from `candidate.from`.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoSession`] if no session exists for the peer. The
    ///   candidate is dropped.
    /// - [`SessionError::Transport`] if the link rejects the candidate; the
    ///   session is closed.
    pub async fn on_ice_candidate(&mut self, candidate: Negotiation) -> Result<(), SessionError> {
        let remote = PeerId::new(candidate.from);
        let Some(session) = self.sessions.get_mut(&remote) else {
            tracing::debug!(peer = %remote, "dropping candidate for idle peer");
            return Err(SessionError::NoSession(remote));
        };

        let result = session.link.add_remote_candidate(&candidate.payload).await;
        if let Err(e) = result {
            tracing::warn!(peer = %remote, error = %e, "rejected candidate");
            self.close_session(&remote, CloseReason::NegotiationFailed(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Handles an event raised by a direct link.
    ///
    /// Events from a link that no longer backs the peer's session are
    /// ignored.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        let LinkEvent {
            link_id,
            remote,
            kind,
        } = event;
        let Some(session) = self
            .sessions
            .get_mut(&remote)
            .filter(|s| s.link_id == link_id)
        else {
            tracing::trace!(peer = %remote, %link_id, "ignoring event from stale link");
            return;
        };

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                let msg = RelayMessage::IceCandidate(Negotiation::to(remote.as_str(), candidate));
                if let Err(e) = self.relay.send(msg) {
                    tracing::warn!(peer = %remote, error = %e, "failed to relay candidate");
                }
            }
            LinkEventKind::Connected => {
                if matches!(session.state, SessionState::Negotiating { .. }) {
                    session.state = SessionState::Connected;
                    self.attempts.remove(&remote);
                    tracing::info!(peer = %remote, %link_id, "direct link connected");
                    self.updates.push(SessionUpdate::Connected(remote));
                }
            }
            LinkEventKind::Data(payload) => {
                self.updates.push(SessionUpdate::Frame {
                    peer: remote,
                    payload,
                });
            }
            LinkEventKind::Closed => {
                self.close_session(
                    &remote,
                    CloseReason::TransportError("link closed by remote".to_string()),
                );
            }
            LinkEventKind::Error(e) => {
                self.close_session(&remote, CloseReason::TransportError(e));
            }
        }
    }

    /// Closes sessions that have been negotiating past their deadline, and
    /// retries the ones this side is responsible for.
    pub async fn expire_stale(&mut self, now: Instant) {
        let expired: Vec<PeerId> = self
            .sessions
            .iter()
            .filter(|(_, s)| matches!(s.state, SessionState::Negotiating { .. }))
            .filter(|(_, s)| s.deadline <= now)
            .map(|(peer, _)| peer.clone())
            .collect();

        for peer in expired {
            self.close_session(&peer, CloseReason::NegotiationTimeout);
            if self.should_retry(&peer) {
                tracing::debug!(peer = %peer, "retrying negotiation");
                self.connect_if_initiator(&peer).await;
            } else if self.local < peer && self.members.contains(&peer) {
                tracing::warn!(
                    peer = %peer,
                    attempts = self.settings.max_negotiation_attempts,
                    "giving up on direct link, relay only"
                );
            }
        }
    }

    /// Sends `payload` over every established link.
    ///
    /// A link that fails to send is closed. Returns how many peers the
    /// payload reached.
    pub async fn broadcast(&mut self, payload: &[u8]) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (peer, session) in &self.sessions {
            if session.state != SessionState::Connected {
                continue;
            }
            match session.link.send(payload).await {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((peer.clone(), e.to_string())),
            }
        }
        for (peer, error) in failed {
            tracing::warn!(peer = %peer, error = %error, "direct send failed");
            self.close_session(&peer, CloseReason::TransportError(error));
        }
        delivered
    }

    /// Sends `payload` to one connected peer.
    ///
    /// # Errors
    ///
    /// - [`SessionError::NoSession`] if the peer has no established link.
    /// - [`SessionError::Transport`] if the send fails; the session is closed.
    pub async fn send_to(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), SessionError> {
        let Some(session) = self
            .sessions
            .get(peer)
            .filter(|s| s.state == SessionState::Connected)
        else {
            return Err(SessionError::NoSession(peer.clone()));
        };

        let result = session.link.send(payload).await;
        if let Err(e) = result {
            self.close_session(peer, CloseReason::TransportError(e.to_string()));
            return Err(e.into());
        }
        Ok(())
    }

    /// Closes every session and forgets the room membership.
    ///
    /// Used on local leave and shutdown; nothing is retried afterwards.
    pub fn close_all(&mut self, reason: &CloseReason) {
        self.members.clear();
        self.attempts.clear();
        let peers: Vec<PeerId> = self.sessions.keys().cloned().collect();
        for peer in peers {
            self.close_session(&peer, reason.clone());
        }
    }

    fn next_link_id(&mut self) -> LinkId {
        self.next_link += 1;
        LinkId(self.next_link)
    }

    fn should_retry(&self, peer: &PeerId) -> bool {
        self.local < *peer
            && self.members.contains(peer)
            && self.attempts.get(peer).copied().unwrap_or(0)
                < self.settings.max_negotiation_attempts
    }

    async fn connect_if_initiator(&mut self, remote: &PeerId) {
        if self.local >= *remote || self.sessions.contains_key(remote) {
            return;
        }
        if let Err(e) = self.start_offer(remote.clone()).await {
            tracing::warn!(peer = %remote, error = %e, "failed to start negotiation");
        }
    }

    async fn start_offer(&mut self, remote: PeerId) -> Result<(), SessionError> {
        let attempt = {
            let count = self.attempts.entry(remote.clone()).or_insert(0);
            *count += 1;
            *count
        };
        let link_id = self.next_link_id();
        let mut link = self
            .provider
            .open(&self.local, &remote, link_id, self.events_tx.clone())?;
        let offer = match link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                link.close();
                return Err(e.into());
            }
        };
        if let Err(e) = self
            .relay
            .send(RelayMessage::Offer(Negotiation::to(remote.as_str(), offer)))
        {
            link.close();
            return Err(e.into());
        }

        tracing::debug!(peer = %remote, %link_id, attempt, "sent offer");
        self.sessions.insert(
            remote,
            Session {
                link,
                link_id,
                state: SessionState::Negotiating { initiator: true },
                deadline: Instant::now() + self.settings.negotiation_timeout,
            },
        );
        Ok(())
    }

    fn close_session(&mut self, peer: &PeerId, reason: CloseReason) -> bool {
        let Some(mut session) = self.sessions.remove(peer) else {
            return false;
        };
        session.link.close();
        tracing::info!(peer = %peer, link_id = %session.link_id, reason = %reason, "session closed");
        self.updates.push(SessionUpdate::Closed {
            peer: peer.clone(),
            reason,
        });
        true
    }
}
