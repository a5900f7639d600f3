//! In-process message pipes.
//!
//! A pipe is a pair of endpoints, each a bidirectional datagram channel: one
//! `write_message` on one end becomes exactly one readable datagram on the other.
//! Datagrams carry opaque bytes plus a side list of [`Handle`]s, which is how
//! pipe endpoints are transferred between peers.
//!
//! Dropping a [`Handle`] closes its endpoint. Once the peer is closed and its
//! queued datagrams are drained, reads report [`ChannelError::PeerClosed`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};

use tokio::sync::Notify;

use crate::error::ChannelError;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// One datagram as it travels through a pipe.
#[derive(Debug, Default)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub handles: Vec<Handle>,
}

impl RawMessage {
    pub fn new(bytes: Vec<u8>, handles: Vec<Handle>) -> Self {
        Self { bytes, handles }
    }
}

#[derive(Default)]
struct MailboxState {
    queue: VecDeque<RawMessage>,
    closed: bool,
    peer_closed: bool,
}

/// Inbound queue of one endpoint. Written by the peer, read by the owner.
#[derive(Default)]
struct Mailbox {
    state: StdMutex<MailboxState>,
    readable: Notify,
}

impl Mailbox {
    fn lock(&self) -> MutexGuard<'_, MailboxState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Mailbox mutex poisoned - recovering queue state");
                poisoned.into_inner()
            }
        }
    }
}

pub(crate) struct Endpoint {
    id: u64,
    inbox: Arc<Mailbox>,
    outbox: Arc<Mailbox>,
}

impl Endpoint {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn write(&self, message: RawMessage) -> Result<(), ChannelError> {
        {
            let inbox = self.inbox.lock();
            if inbox.closed {
                return Err(ChannelError::Closed);
            }
            if inbox.peer_closed {
                return Err(ChannelError::PeerClosed);
            }
        }

        let len = message.bytes.len();
        let num_handles = message.handles.len();
        {
            let mut peer = self.outbox.lock();
            if peer.closed {
                return Err(ChannelError::PeerClosed);
            }
            peer.queue.push_back(message);
        }
        self.outbox.readable.notify_one();

        tracing::trace!(endpoint = self.id, bytes = len, handles = num_handles, "Wrote datagram");
        Ok(())
    }

    /// Non-blocking read. `Ok(None)` means nothing is queued right now.
    pub(crate) fn try_read(&self) -> Result<Option<RawMessage>, ChannelError> {
        let mut inbox = self.inbox.lock();
        if inbox.closed {
            return Err(ChannelError::Closed);
        }
        match inbox.queue.pop_front() {
            Some(message) => Ok(Some(message)),
            None if inbox.peer_closed => Err(ChannelError::PeerClosed),
            None => Ok(None),
        }
    }

    /// Resolves after the next write, peer closure or local closure.
    pub(crate) async fn readable(&self) {
        self.inbox.readable.notified().await;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inbox.lock().closed
    }

    pub(crate) fn close(&self) {
        let dropped = {
            let mut inbox = self.inbox.lock();
            if inbox.closed {
                return;
            }
            inbox.closed = true;
            std::mem::take(&mut inbox.queue)
        };
        // Queued datagrams may own handles; closing them must not happen under our lock.
        drop(dropped);

        self.outbox.lock().peer_closed = true;
        self.outbox.readable.notify_one();
        self.inbox.readable.notify_one();
        tracing::debug!(endpoint = self.id, "Endpoint closed");
    }
}

/// Owning reference to one end of a message pipe.
///
/// Handles are never cloned: transferring one moves it into a message's handle
/// list, and dropping it closes the endpoint.
pub struct Handle {
    endpoint: Arc<Endpoint>,
}

impl Handle {
    pub fn id(&self) -> u64 {
        self.endpoint.id
    }

    pub fn write_message(&self, bytes: Vec<u8>, handles: Vec<Handle>) -> Result<(), ChannelError> {
        self.endpoint.write(RawMessage::new(bytes, handles))
    }

    pub fn write_raw(&self, message: RawMessage) -> Result<(), ChannelError> {
        self.endpoint.write(message)
    }

    pub fn read_message(&self) -> Result<Option<RawMessage>, ChannelError> {
        self.endpoint.try_read()
    }

    pub async fn readable(&self) {
        self.endpoint.readable().await
    }

    pub fn close(self) {
        drop(self);
    }

    pub(crate) fn endpoint(&self) -> Arc<Endpoint> {
        Arc::clone(&self.endpoint)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.endpoint.close();
    }
}

impl PartialEq for Handle {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Handle").field(&self.endpoint.id).finish()
    }
}

/// Create both ends of a new pipe.
pub fn create_message_pipe() -> (Handle, Handle) {
    let a = Arc::new(Mailbox::default());
    let b = Arc::new(Mailbox::default());
    let first = Endpoint {
        id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
        inbox: Arc::clone(&a),
        outbox: Arc::clone(&b),
    };
    let second = Endpoint {
        id: NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed),
        inbox: b,
        outbox: a,
    };
    tracing::trace!(first = first.id, second = second.id, "Created message pipe");
    (
        Handle {
            endpoint: Arc::new(first),
        },
        Handle {
            endpoint: Arc::new(second),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagrams_arrive_in_order() {
        let (a, b) = create_message_pipe();
        a.write_message(vec![1], Vec::new()).unwrap();
        a.write_message(vec![2, 3], Vec::new()).unwrap();

        assert_eq!(b.read_message().unwrap().unwrap().bytes, vec![1]);
        assert_eq!(b.read_message().unwrap().unwrap().bytes, vec![2, 3]);
        assert!(b.read_message().unwrap().is_none());
    }

    #[test]
    fn peer_closed_after_queue_drained() {
        let (a, b) = create_message_pipe();
        a.write_message(vec![7], Vec::new()).unwrap();
        a.close();

        assert_eq!(b.read_message().unwrap().unwrap().bytes, vec![7]);
        assert_eq!(b.read_message().unwrap_err(), ChannelError::PeerClosed);
        assert_eq!(
            b.write_message(vec![1], Vec::new()).unwrap_err(),
            ChannelError::PeerClosed
        );
    }

    #[test]
    fn handles_transfer_through_pipe() {
        let (a, b) = create_message_pipe();
        let (c, d) = create_message_pipe();
        let c_id = c.id();

        a.write_message(vec![0], vec![c]).unwrap();
        let received = b.read_message().unwrap().unwrap();
        assert_eq!(received.handles.len(), 1);
        assert_eq!(received.handles[0].id(), c_id);

        received.handles[0].write_message(vec![9], Vec::new()).unwrap();
        assert_eq!(d.read_message().unwrap().unwrap().bytes, vec![9]);
    }

    #[test]
    fn closing_drops_queued_handles() {
        let (a, b) = create_message_pipe();
        let (c, d) = create_message_pipe();

        a.write_message(vec![0], vec![c]).unwrap();
        b.close();

        assert_eq!(d.read_message().unwrap_err(), ChannelError::PeerClosed);
    }

    #[tokio::test]
    async fn readable_wakes_on_write() {
        let (a, b) = create_message_pipe();
        let waiter = tokio::spawn(async move {
            b.readable().await;
            b.read_message().unwrap().unwrap().bytes
        });
        tokio::task::yield_now().await;
        a.write_message(vec![4, 2], Vec::new()).unwrap();
        assert_eq!(waiter.await.unwrap(), vec![4, 2]);
    }
}
