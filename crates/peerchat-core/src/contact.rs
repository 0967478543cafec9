//! Per-peer chat session handle
//!
//! A [`Contact`] owns one chat stream. The write half is driven by a
//! dedicated writer task fed from an unbounded outbox, so a slow peer only
//! backs up its own queue and never loses a line. The read half is handed
//! out once to the receiver.
//!
//! Each contact has its own lifetime token. It is not derived from the node's
//! shutdown token: a conversation ends when its stream fails, the transport
//! reports the connection gone, or [`Contact::close`] is called.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use libp2p::PeerId;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::address::short_peer_id;
use crate::transport::{ChatStream, Direction, StreamIo};

static NEXT_CONTACT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a contact
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ContactId(u64);

impl ContactId {
    /// Allocate the next identifier
    pub fn next() -> Self {
        Self(NEXT_CONTACT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Buffered read half of a contact's stream
pub type ContactReader = BufReader<ReadHalf<Box<dyn StreamIo>>>;

/// What happened to a line handed to [`Contact::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued for the writer task
    Queued,
    /// The contact is closed; nothing was attempted
    Skipped,
}

/// Serializable view of a contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContactSummary {
    pub id: ContactId,
    pub peer: String,
    pub name: String,
    pub direction: Direction,
    pub closed: bool,
}

/// One peer conversation
pub struct Contact {
    id: ContactId,
    peer: PeerId,
    direction: Direction,
    outbox: mpsc::UnboundedSender<String>,
    reader: Mutex<Option<ContactReader>>,
    lifetime: CancellationToken,
}

impl Contact {
    /// Wrap a negotiated chat stream and start its writer task
    pub fn new(stream: ChatStream) -> Arc<Self> {
        let ChatStream {
            peer,
            direction,
            io,
            closed,
        } = stream;

        let id = ContactId::next();
        let (read_half, write_half) = tokio::io::split(io);
        let (outbox, lines) = mpsc::unbounded_channel();
        let lifetime = CancellationToken::new();

        tokio::spawn(write_loop(
            id,
            peer,
            write_half,
            lines,
            lifetime.clone(),
            closed,
        ));

        Arc::new(Self {
            id,
            peer,
            direction,
            outbox,
            reader: Mutex::new(Some(BufReader::new(read_half))),
            lifetime,
        })
    }

    pub fn id(&self) -> ContactId {
        self.id
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Whether the conversation has ended
    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// End the conversation; the writer shuts the stream down
    pub fn close(&self) {
        if !self.lifetime.is_cancelled() {
            debug!(contact = %self.id, peer = %self.peer, "Closing contact");
            self.lifetime.cancel();
        }
    }

    /// Token cancelled when the contact closes
    pub fn lifetime(&self) -> &CancellationToken {
        &self.lifetime
    }

    /// Hand out the read half. Returns `None` after the first call.
    pub fn take_reader(&self) -> Option<ContactReader> {
        self.reader.lock().take()
    }

    /// Queue one chat line for this contact without waiting.
    ///
    /// The writer appends the newline terminator and flushes after each line.
    /// Lines queued for a live contact are written in order.
    pub fn send(&self, text: &str) -> SendOutcome {
        if self.is_closed() {
            return SendOutcome::Skipped;
        }

        match self.outbox.send(text.to_string()) {
            Ok(()) => SendOutcome::Queued,
            Err(_) => SendOutcome::Skipped,
        }
    }

    pub fn summary(&self) -> ContactSummary {
        ContactSummary {
            id: self.id,
            peer: self.peer.to_string(),
            name: short_peer_id(&self.peer),
            direction: self.direction,
            closed: self.is_closed(),
        }
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Contact")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("direction", &self.direction)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn write_loop(
    id: ContactId,
    peer: PeerId,
    mut writer: WriteHalf<Box<dyn StreamIo>>,
    mut lines: mpsc::UnboundedReceiver<String>,
    lifetime: CancellationToken,
    transport_closed: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = lifetime.cancelled() => break,
            _ = transport_closed.cancelled() => {
                debug!(contact = %id, %peer, "Transport closed the stream");
                lifetime.cancel();
                break;
            }
            line = lines.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        if let Err(e) = write_line(&mut writer, &line).await {
            warn!(contact = %id, %peer, error = %e, "Write to contact failed");
            lifetime.cancel();
            break;
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(contact = %id, %peer, error = %e, "Stream shutdown failed");
    }
}

async fn write_line(
    writer: &mut WriteHalf<Box<dyn StreamIo>>,
    line: &str,
) -> std::io::Result<()> {
    let mut framed = String::with_capacity(line.len() + 1);
    framed.push_str(line);
    framed.push('\n');
    writer.write_all(framed.as_bytes()).await?;
    writer.flush().await
}
