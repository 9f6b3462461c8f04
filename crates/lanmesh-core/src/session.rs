//! Session abstraction and in-memory fabric
//!
//! A [`SessionLink`] is the raw framed stream a connection runs over:
//! a direct peer TCP session, a shared relay session, or the in-memory
//! [`MemorySession`] used by tests. Inbound frames always arrive through
//! an [`mpsc`] channel handed out at session creation; the trait only
//! covers identity and the outbound path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::protocol::LinkFrame;

/// Process-unique identity of an underlying session
///
/// Connections sharing one relay session share its id; the router uses
/// this for split-horizon flooding.
pub type SessionId = u64;

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh process-unique session id
pub fn next_session_id() -> SessionId {
    SESSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// A raw framed stream a connection runs over
#[async_trait]
pub trait SessionLink: Send + Sync + 'static {
    /// Process-unique identity of this session
    fn id(&self) -> SessionId;

    /// Whether the session can still carry frames
    fn is_open(&self) -> bool;

    /// Write one frame to the session
    async fn send_frame(&self, frame: LinkFrame) -> Result<(), TransportError>;

    /// Close the session; subsequent sends fail
    fn close(&self);
}

/// One end of an in-memory session pair
///
/// Frames sent on one end arrive on the other end's inbox. Closing
/// either end closes both, like a TCP stream.
pub struct MemorySession {
    id: SessionId,
    peer_tx: mpsc::Sender<LinkFrame>,
    open: Arc<AtomicBool>,
}

/// A [`MemorySession`] together with its inbound frame channel
pub struct MemoryEnd {
    /// The session handle to send through
    pub session: Arc<MemorySession>,
    /// Frames the other end has sent
    pub inbox: mpsc::Receiver<LinkFrame>,
}

/// Create a connected pair of in-memory sessions
pub fn memory_pair(capacity: usize) -> (MemoryEnd, MemoryEnd) {
    let (a_tx, a_rx) = mpsc::channel(capacity);
    let (b_tx, b_rx) = mpsc::channel(capacity);
    let open = Arc::new(AtomicBool::new(true));

    let a = MemorySession {
        id: next_session_id(),
        peer_tx: b_tx,
        open: open.clone(),
    };
    let b = MemorySession {
        id: next_session_id(),
        peer_tx: a_tx,
        open,
    };

    (
        MemoryEnd {
            session: Arc::new(a),
            inbox: a_rx,
        },
        MemoryEnd {
            session: Arc::new(b),
            inbox: b_rx,
        },
    )
}

#[async_trait]
impl SessionLink for MemorySession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn send_frame(&self, frame: LinkFrame) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ConnectionClosed);
        }
        self.peer_tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}
