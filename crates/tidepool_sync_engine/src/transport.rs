//! Transport layer abstraction for sync messages.

use crate::error::{SyncError, SyncResult};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use tidepool_sync_protocol::ClientMessage;
use tokio::sync::mpsc;

/// A sync transport carries client messages to the server.
///
/// Server messages travel the other way and are handed to
/// [`crate::SyncEngine::receive`] by whoever owns the connection. This
/// trait abstracts the network layer, allowing for different
/// implementations (WebSocket, in-process channel, mock for testing).
pub trait SyncTransport: Send + Sync {
    /// Sends one message.
    fn send(&self, message: &ClientMessage) -> SyncResult<()>;

    /// (Re)opens the connection.
    fn connect(&self) -> SyncResult<()> {
        Ok(())
    }

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> SyncResult<()>;
}

/// A mock transport for testing.
///
/// Records every message sent so tests can inspect or forward them.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<VecDeque<ClientMessage>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(VecDeque::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Makes sends fail with a retryable error.
    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Removes and returns everything sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().drain(..).collect()
    }

    /// Number of messages waiting in the sent queue.
    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(SyncError::transport_retryable("mock send failure"));
        }
        self.sent.lock().push_back(message.clone());
        Ok(())
    }

    fn connect(&self) -> SyncResult<()> {
        self.set_connected(true);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> SyncResult<()> {
        self.set_connected(false);
        Ok(())
    }
}

/// Sends messages into a tokio channel, for in-process servers.
#[derive(Debug)]
pub struct ChannelTransport {
    sender: mpsc::UnboundedSender<ClientMessage>,
    closed: AtomicBool,
}

impl ChannelTransport {
    /// Creates a transport and the receiving end of its channel.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                closed: AtomicBool::new(false),
            },
            receiver,
        )
    }
}

impl SyncTransport for ChannelTransport {
    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.sender
            .send(message.clone())
            .map_err(|_| SyncError::transport_fatal("channel receiver dropped"))
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.sender.is_closed()
    }

    fn close(&self) -> SyncResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
