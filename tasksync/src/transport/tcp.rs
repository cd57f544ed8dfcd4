//! TCP direct transport.
//!
//! The initiator binds an ephemeral listener and advertises its address as
//! its only candidate. The responder dials that address once the candidate
//! arrives and identifies itself with a handshake frame carrying its peer id.
//! After that both directions carry length-prefixed frames
//! (see [`tasksync_proto::codec::frame`]).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tasksync_proto::codec::{self, FRAME_HEADER_LEN};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

use super::{
    DirectLink, DirectTransportProvider, LinkEvent, LinkEventKind, LinkId, PeerId, TransportError,
};

/// Offer and answer payload for this provider's protocol version.
const PROTOCOL: &[u8] = b"tcp/1";

/// Largest frame a link will accept from the remote.
pub const MAX_LINK_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Default time allowed for the responder to dial the initiator.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type SharedWriter = Arc<Mutex<Option<OwnedWriteHalf>>>;

/// Opens direct links over plain TCP.
#[derive(Debug, Clone)]
pub struct TcpProvider {
    bind_host: String,
    rendezvous: Vec<String>,
    connect_timeout: Duration,
}

impl TcpProvider {
    /// Creates a provider that listens on `bind_host` for inbound links.
    ///
    /// `bind_host` is also what the initiator advertises, so it must be an
    /// address the remote can reach (not `0.0.0.0`).
    pub fn new(bind_host: impl Into<String>, rendezvous: Vec<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            rendezvous,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the dial timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl DirectTransportProvider for TcpProvider {
    type Link = TcpLink;

    fn open(
        &self,
        local: &PeerId,
        remote: &PeerId,
        link_id: LinkId,
        events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Result<Self::Link, TransportError> {
        Ok(TcpLink {
            ctx: LinkContext {
                local: local.clone(),
                remote: remote.clone(),
                link_id,
                events,
            },
            bind_host: self.bind_host.clone(),
            connect_timeout: self.connect_timeout,
            writer: Arc::new(Mutex::new(None)),
            initiator: None,
            tasks: Vec::new(),
        })
    }

    fn rendezvous_servers(&self) -> &[String] {
        &self.rendezvous
    }
}

/// Identity of one link plus its event sink; cloned into background tasks.
#[derive(Debug, Clone)]
struct LinkContext {
    local: PeerId,
    remote: PeerId,
    link_id: LinkId,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl LinkContext {
    fn emit(&self, kind: LinkEventKind) {
        let _ = self.events.send(LinkEvent {
            link_id: self.link_id,
            remote: self.remote.clone(),
            kind,
        });
    }
}

/// One end of a TCP link.
#[derive(Debug)]
pub struct TcpLink {
    ctx: LinkContext,
    bind_host: String,
    connect_timeout: Duration,
    writer: SharedWriter,
    /// `Some(true)` once we made an offer, `Some(false)` once we answered one.
    initiator: Option<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl DirectLink for TcpLink {
    async fn create_offer(&mut self) -> Result<Vec<u8>, TransportError> {
        let listener = TcpListener::bind((self.bind_host.as_str(), 0)).await?;
        let addr = listener.local_addr()?;
        self.initiator = Some(true);

        tracing::debug!(peer = %self.ctx.remote, %addr, "listening for direct link");
        self.ctx
            .emit(LinkEventKind::LocalCandidate(addr.to_string().into_bytes()));

        let ctx = self.ctx.clone();
        let writer = Arc::clone(&self.writer);
        self.tasks
            .push(tokio::spawn(accept_one(listener, ctx, writer)));
        Ok(PROTOCOL.to_vec())
    }

    async fn accept_offer(&mut self, offer: &[u8]) -> Result<Vec<u8>, TransportError> {
        if offer != PROTOCOL {
            return Err(TransportError::Negotiation(format!(
                "unsupported offer: {}",
                String::from_utf8_lossy(offer)
            )));
        }
        self.initiator = Some(false);
        Ok(PROTOCOL.to_vec())
    }

    async fn accept_answer(&mut self, answer: &[u8]) -> Result<(), TransportError> {
        if answer == PROTOCOL {
            Ok(())
        } else {
            Err(TransportError::Negotiation(format!(
                "unsupported answer: {}",
                String::from_utf8_lossy(answer)
            )))
        }
    }

    async fn add_remote_candidate(&mut self, candidate: &[u8]) -> Result<(), TransportError> {
        if self.initiator != Some(false) {
            tracing::debug!(peer = %self.ctx.remote, "ignoring candidate on listening side");
            return Ok(());
        }
        let addr: SocketAddr = std::str::from_utf8(candidate)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| TransportError::Negotiation("malformed tcp candidate".to_string()))?;

        let ctx = self.ctx.clone();
        let writer = Arc::clone(&self.writer);
        let timeout = self.connect_timeout;
        self.tasks
            .push(tokio::spawn(dial(addr, timeout, ctx, writer)));
        Ok(())
    }

    async fn send(&self, payload: &[u8]) -> Result<(), TransportError> {
        let framed = codec::frame(payload)
            .map_err(|e| TransportError::Io(std::io::Error::other(e.to_string())))?;
        let mut guard = self.writer.lock().await;
        let stream = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;
        if let Err(e) = stream.write_all(&framed).await {
            *guard = None;
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    fn close(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Ok(mut guard) = self.writer.try_lock() {
            *guard = None;
        }
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Initiator side: accept the responder's connection and verify its id.
async fn accept_one(listener: TcpListener, ctx: LinkContext, writer: SharedWriter) {
    let (stream, from) = match listener.accept().await {
        Ok(accepted) => accepted,
        Err(e) => {
            ctx.emit(LinkEventKind::Error(e.to_string()));
            return;
        }
    };
    drop(listener);

    let (mut reader, write_half) = stream.into_split();
    match read_handshake(&mut reader).await {
        Ok(id) if id == ctx.remote.as_str() => {}
        Ok(id) => {
            tracing::warn!(peer = %ctx.remote, claimed = %id, %from, "direct link handshake mismatch");
            ctx.emit(LinkEventKind::Error(format!("unexpected peer {id}")));
            return;
        }
        Err(e) => {
            ctx.emit(LinkEventKind::Error(e.to_string()));
            return;
        }
    }

    *writer.lock().await = Some(write_half);
    ctx.emit(LinkEventKind::Connected);
    read_frames(reader, ctx).await;
}

/// Responder side: dial the advertised address and introduce ourselves.
async fn dial(addr: SocketAddr, timeout: Duration, ctx: LinkContext, writer: SharedWriter) {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            ctx.emit(LinkEventKind::Error(e.to_string()));
            return;
        }
        Err(_) => {
            ctx.emit(LinkEventKind::Error(format!("dial {addr} timed out")));
            return;
        }
    };

    let (reader, mut write_half) = stream.into_split();
    let hello = match codec::frame(ctx.local.as_str().as_bytes()) {
        Ok(bytes) => bytes,
        Err(e) => {
            ctx.emit(LinkEventKind::Error(e.to_string()));
            return;
        }
    };
    if let Err(e) = write_half.write_all(&hello).await {
        ctx.emit(LinkEventKind::Error(e.to_string()));
        return;
    }

    *writer.lock().await = Some(write_half);
    ctx.emit(LinkEventKind::Connected);
    read_frames(reader, ctx).await;
}

async fn read_handshake(reader: &mut OwnedReadHalf) -> std::io::Result<String> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    reader.read_exact(&mut header).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > 1024 {
        return Err(std::io::Error::other("handshake frame too large"));
    }
    let mut id = vec![0u8; len];
    reader.read_exact(&mut id).await?;
    String::from_utf8(id).map_err(std::io::Error::other)
}

/// Reads length-prefixed frames until EOF or error, raising one event each.
async fn read_frames(mut reader: OwnedReadHalf, ctx: LinkContext) {
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = vec![0u8; 8192];
    loop {
        while let Some((data, used)) = codec::unframe(&buf)
            .ok()
            .map(|(payload, used)| (payload.to_vec(), used))
        {
            buf.drain(..used);
            ctx.emit(LinkEventKind::Data(data));
        }
        if buf.len() > MAX_LINK_FRAME_SIZE + FRAME_HEADER_LEN {
            ctx.emit(LinkEventKind::Error("frame too large".to_string()));
            return;
        }
        match reader.read(&mut chunk).await {
            Ok(0) => {
                tracing::debug!(peer = %ctx.remote, "direct link closed by remote");
                ctx.emit(LinkEventKind::Closed);
                return;
            }
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
            Err(e) => {
                ctx.emit(LinkEventKind::Error(e.to_string()));
                return;
            }
        }
    }
}
