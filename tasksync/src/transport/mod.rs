//! Transport layer abstraction for `TaskSync`.
//!
//! Two kinds of transport carry task traffic:
//! - the relay connection ([`relay::RelayClient`]), which doubles as the
//!   signaling channel and the always-available fallback path
//! - direct peer links, created by a [`DirectTransportProvider`]
//!
//! Direct providers shipped here:
//! - [`loopback::LoopbackNetwork`] is an in-process network for testing
//! - [`tcp::TcpProvider`] opens plain TCP streams between peers

pub mod loopback;
pub mod relay;
pub mod tcp;

use std::fmt;
use std::future::Future;

use tokio::sync::mpsc;

/// Identifier of a room participant: the connection id the relay assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier from a string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Return the string representation of this peer ID.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Per-open identifier tying [`LinkEvent`]s to one link incarnation.
///
/// A session that is torn down and renegotiated gets a new `LinkId`, so
/// late events from the old link can be told apart and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

/// What happened on a direct link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEventKind {
    /// The link produced a connectivity candidate to hand to the remote.
    LocalCandidate(Vec<u8>),
    /// The link is up and can carry data.
    Connected,
    /// The remote sent a payload.
    Data(Vec<u8>),
    /// The link closed cleanly.
    Closed,
    /// The link failed.
    Error(String),
}

/// An event raised by a direct link, delivered to the session manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkEvent {
    /// Which link incarnation raised it.
    pub link_id: LinkId,
    /// The peer on the other end.
    pub remote: PeerId,
    /// What happened.
    pub kind: LinkEventKind,
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection to the peer has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The specified peer is not reachable via this transport.
    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    /// The remote sent a negotiation payload this link cannot use.
    #[error("negotiation failed: {0}")]
    Negotiation(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for direct peer links.
///
/// The provider is the boundary to whatever actually moves bytes between
/// peers. Every link it opens reports back through the `events` channel
/// handed to [`open`](DirectTransportProvider::open).
pub trait DirectTransportProvider: Send + Sync + 'static {
    /// The link type this provider produces.
    type Link: DirectLink;

    /// Create a fresh, unnegotiated link from `local` to `remote`.
    ///
    /// # Errors
    ///
    /// Returns a [`TransportError`] if the provider cannot allocate a link.
    fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link_id: LinkId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self::Link, TransportError>;

    /// Rendezvous (STUN/TURN-style) servers the provider is configured with.
    fn rendezvous_servers(&self) -> &[String];
}

/// One direct link between two peers.
///
/// The initiator calls [`create_offer`](Self::create_offer) and later
/// [`accept_answer`](Self::accept_answer); the responder calls
/// [`accept_offer`](Self::accept_offer). Both sides feed the remote's
/// candidates to [`add_remote_candidate`](Self::add_remote_candidate).
/// The link announces readiness with [`LinkEventKind::Connected`].
pub trait DirectLink: Send + Sync + 'static {
    /// Produce the opaque offer payload.
    fn create_offer(
        &mut self,
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Consume the remote's offer and produce the answer payload.
    fn accept_offer(
        &mut self,
        offer: &[u8],
    ) -> impl Future<Output = Result<Vec<u8>, TransportError>> + Send;

    /// Consume the remote's answer.
    fn accept_answer(
        &mut self,
        answer: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Feed one connectivity candidate received from the remote.
    fn add_remote_candidate(
        &mut self,
        candidate: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Send a payload over an established link.
    fn send(&self, payload: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Release the link. No events are raised for it afterwards.
    fn close(&mut self);
}
