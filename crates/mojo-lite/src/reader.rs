//! Channel reader: the one suspension point between a pipe and its owner.
//!
//! The reader drains every queued datagram before it waits again, and reports
//! a failed pipe exactly once before stopping for good.
//!
//! ```text
//! Idle ──(queue empty)──► Watching ──(readable)──► Idle
//!   │                        │
//!   └──(error / cancel)──────┴──────────────────► Stopped
//! ```

use std::ops::ControlFlow;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::ChannelError;
use crate::pipe::{Endpoint, Handle, RawMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Idle,
    Watching,
    Stopped,
}

#[derive(Debug)]
pub enum ReadEvent {
    Message(RawMessage),
    /// Terminal: the reader is stopped after delivering this.
    Error(ChannelError),
}

pub struct ChannelReader {
    endpoint: Arc<Endpoint>,
    cancel: CancellationToken,
    state: ReaderState,
}

impl ChannelReader {
    pub fn new(handle: &Handle) -> Self {
        Self::with_cancellation(handle, CancellationToken::new())
    }

    pub fn with_cancellation(handle: &Handle, cancel: CancellationToken) -> Self {
        tracing::debug!(endpoint = handle.id(), "Channel reader started");
        Self {
            endpoint: handle.endpoint(),
            cancel,
            state: ReaderState::Idle,
        }
    }

    pub fn state(&self) -> ReaderState {
        self.state
    }

    /// Token that stops this reader when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(&mut self) {
        self.cancel.cancel();
        self.enter_stopped();
    }

    fn enter_stopped(&mut self) {
        if self.state != ReaderState::Stopped {
            tracing::debug!(endpoint = self.endpoint.id(), "Channel reader stopped");
        }
        self.state = ReaderState::Stopped;
    }

    /// Next datagram or terminal error. `None` once stopped.
    pub async fn next_event(&mut self) -> Option<ReadEvent> {
        loop {
            if self.state == ReaderState::Stopped || self.cancel.is_cancelled() {
                self.enter_stopped();
                return None;
            }

            match self.endpoint.try_read() {
                Ok(Some(message)) => {
                    self.state = ReaderState::Idle;
                    tracing::trace!(
                        endpoint = self.endpoint.id(),
                        bytes = message.bytes.len(),
                        handles = message.handles.len(),
                        "Read datagram"
                    );
                    return Some(ReadEvent::Message(message));
                }
                Ok(None) => {
                    self.state = ReaderState::Watching;
                    let cancelled = tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => true,
                        _ = self.endpoint.readable() => false,
                    };
                    if cancelled {
                        self.enter_stopped();
                        return None;
                    }
                    self.state = ReaderState::Idle;
                }
                Err(e) => {
                    tracing::debug!(endpoint = self.endpoint.id(), error = %e, "Channel reader failed");
                    self.enter_stopped();
                    return Some(ReadEvent::Error(e));
                }
            }
        }
    }

    /// Drive the reader to completion, dispatching each datagram to `on_message`.
    ///
    /// `on_message` returning `Break` stops the reader without calling `on_error`.
    pub async fn run<M, E>(mut self, mut on_message: M, on_error: E)
    where
        M: FnMut(RawMessage) -> ControlFlow<()>,
        E: FnOnce(ChannelError),
    {
        while let Some(event) = self.next_event().await {
            match event {
                ReadEvent::Message(message) => {
                    if on_message(message).is_break() {
                        self.stop();
                        return;
                    }
                }
                ReadEvent::Error(e) => {
                    on_error(e);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::pipe::create_message_pipe;

    #[tokio::test]
    async fn drains_queue_then_reports_peer_closed_once() {
        let (a, b) = create_message_pipe();
        for i in 0..3u8 {
            a.write_message(vec![i], Vec::new()).unwrap();
        }
        a.close();

        let mut reader = ChannelReader::new(&b);
        let mut seen = Vec::new();
        let mut errors = Vec::new();
        while let Some(event) = reader.next_event().await {
            match event {
                ReadEvent::Message(m) => seen.push(m.bytes[0]),
                ReadEvent::Error(e) => errors.push(e),
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(errors, vec![ChannelError::PeerClosed]);
        assert_eq!(reader.state(), ReaderState::Stopped);
        assert!(reader.next_event().await.is_none());
    }

    #[tokio::test]
    async fn cancellation_stops_a_watching_reader() {
        let (_a, b) = create_message_pipe();
        let mut reader = ChannelReader::new(&b);
        let token = reader.cancellation_token();

        let task = tokio::spawn(async move {
            let event = reader.next_event().await;
            (event.is_none(), reader.state())
        });
        tokio::task::yield_now().await;
        token.cancel();

        assert_eq!(task.await.unwrap(), (true, ReaderState::Stopped));
    }

    #[tokio::test]
    async fn run_dispatches_until_break() {
        let (a, b) = create_message_pipe();
        a.write_message(vec![1], Vec::new()).unwrap();
        a.write_message(vec![2], Vec::new()).unwrap();
        a.write_message(vec![3], Vec::new()).unwrap();

        let seen = StdMutex::new(Vec::new());
        let errored = StdMutex::new(false);
        ChannelReader::new(&b)
            .run(
                |m| {
                    seen.lock().unwrap().push(m.bytes[0]);
                    if m.bytes[0] == 2 {
                        ControlFlow::Break(())
                    } else {
                        ControlFlow::Continue(())
                    }
                },
                |_| *errored.lock().unwrap() = true,
            )
            .await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert!(!*errored.lock().unwrap());
        // The third datagram is still queued for whoever reads next.
        assert_eq!(b.read_message().unwrap().unwrap().bytes, vec![3]);
    }
}
