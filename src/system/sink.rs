//! Sink pool for broadcasting log output
//!
//! Provides a pub/sub mechanism for streaming a build's log entries to
//! multiple live subscribers.

use tokio::sync::broadcast;

/// A pool of sinks for broadcasting data to multiple subscribers.
///
/// This is used to stream console output to multiple WebSocket connections.
pub struct SinkPool {
    sender: broadcast::Sender<Vec<u8>>,
    // Keep a receiver to prevent the channel from closing
    _receiver: broadcast::Receiver<Vec<u8>>,
}

impl SinkPool {
    /// Create a new sink pool with the specified capacity
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// Create a new sink pool with custom capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender, _receiver }
    }

    /// Subscribe to the sink pool
    ///
    /// Returns a receiver that will receive all messages sent after subscribing.
    pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
        self.sender.subscribe()
    }

    /// Push data to all subscribers
    ///
    /// If there are no subscribers, the data is silently dropped.
    pub fn push(&self, data: Vec<u8>) {
        // Ignore send errors (no receivers)
        let _ = self.sender.send(data);
    }

    /// Push a string to all subscribers
    pub fn push_string(&self, data: &str) {
        self.push(data.as_bytes().to_vec());
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for SinkPool {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SinkPool {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            _receiver: self.sender.subscribe(),
        }
    }
}
