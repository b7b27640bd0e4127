//! Transport layer abstraction for the reconciliation client.

use crate::error::{ClientError, ClientResult};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use taskboard_sync_protocol::ClientMessage;
use tokio::sync::mpsc;

/// Sends client frames to the sync server.
///
/// Server frames travel the other way and are fed to
/// [`ReconciliationClient::handle_message`](crate::ReconciliationClient::handle_message)
/// by whoever owns the connection, so implementations only deal with the
/// outbound direction.
pub trait SyncTransport: Send + Sync {
    /// Sends one frame.
    fn send(&self, message: &ClientMessage) -> ClientResult<()>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;

    /// Closes the transport connection.
    fn close(&self) -> ClientResult<()>;
}

/// A transport that records frames instead of sending them.
#[derive(Debug)]
pub struct MockTransport {
    connected: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
}

impl MockTransport {
    /// Creates a connected mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            sent: Mutex::new(Vec::new()),
        }
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().clone()
    }

    /// Returns and clears the frames sent so far.
    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncTransport for MockTransport {
    fn send(&self, message: &ClientMessage) -> ClientResult<()> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        self.sent.lock().push(message.clone());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn close(&self) -> ClientResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// A transport that hands frames to an in-process channel.
///
/// Used to run a client against a server in the same process; the
/// receiving side feeds each frame to a server session.
#[derive(Debug)]
pub struct ChannelTransport {
    tx: Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>,
}

impl ChannelTransport {
    /// Creates a transport and the receiver for its frames.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx: Mutex::new(Some(tx)),
            },
            rx,
        )
    }

    /// Points the transport at a new channel, as after a reconnect.
    pub fn reconnect(&self) -> mpsc::UnboundedReceiver<ClientMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.tx.lock() = Some(tx);
        rx
    }
}

impl SyncTransport for ChannelTransport {
    fn send(&self, message: &ClientMessage) -> ClientResult<()> {
        let tx = self.tx.lock();
        let tx = tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(message.clone())
            .map_err(|_| ClientError::transport_retryable("channel closed"))
    }

    fn is_connected(&self) -> bool {
        self.tx.lock().as_ref().is_some_and(|tx| !tx.is_closed())
    }

    fn close(&self) -> ClientResult<()> {
        self.tx.lock().take();
        Ok(())
    }
}
