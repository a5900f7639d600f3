//! Interface proxy: the client side of a pipe.
//!
//! Each call that expects a reply gets a fresh request id and a pending entry
//! keyed by that id. Replies are matched by `(request_id, ordinal)`, so they
//! may arrive in any order. Any protocol violation or channel failure closes
//! the pipe and rejects every pending call.

use std::collections::HashMap;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::task::{Context, Poll};

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::BindingConfig;
use crate::control::{
    ControlMessageHandler, RUN_MESSAGE_ID, control_types, flush_params, parse_query_version_result,
    query_version_params,
};
use crate::error::{BindingError, DecodeError};
use crate::message::{MessageHeader, decode_message_payload, serialize_message};
use crate::pipe::{Handle, RawMessage};
use crate::reader::ChannelReader;
use crate::types::StructSpec;
use crate::value::{MojomStruct, StructValue, Value};

type ReplySender = oneshot::Sender<Result<StructValue, BindingError>>;

struct PendingResponse {
    ordinal: u32,
    response_spec: Arc<StructSpec>,
    sender: ReplySender,
}

#[derive(Default)]
struct ProxyState {
    handle: Option<Handle>,
    reader_cancel: Option<CancellationToken>,
    next_request_id: u64,
    pending: HashMap<u64, PendingResponse>,
}

struct ProxyShared {
    state: StdMutex<ProxyState>,
    config: BindingConfig,
    control: ControlMessageHandler,
}

impl ProxyShared {
    fn lock(&self) -> MutexGuard<'_, ProxyState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Proxy mutex poisoned - recovering pending map");
                poisoned.into_inner()
            }
        }
    }

    fn on_message(&self, raw: RawMessage, token: &CancellationToken) -> ControlFlow<()> {
        if token.is_cancelled() {
            tracing::warn!("Dropping message read after the proxy was unbound");
            return ControlFlow::Break(());
        }

        let header = match MessageHeader::parse(&raw.bytes) {
            Ok(header) => header,
            Err(e) => return self.fail(e.into()),
        };

        if ControlMessageHandler::is_control_message(&header) && !header.is_response() {
            return self.answer_control(&header, raw);
        }

        if !header.is_response() || header.expects_response() {
            return self.fail(BindingError::UnexpectedMessage(
                "received unexpected request message",
            ));
        }

        let removed = self.lock().pending.remove(&header.request_id);
        let Some(pending) = removed else {
            return self.fail(
                DecodeError::UnexpectedResponse {
                    request_id: header.request_id,
                }
                .into(),
            );
        };

        if pending.ordinal != header.ordinal {
            let err: BindingError = DecodeError::OrdinalMismatch {
                expected: pending.ordinal,
                actual: header.ordinal,
            }
            .into();
            let _ = pending.sender.send(Err(err.clone()));
            return self.fail(err);
        }

        match decode_message_payload(raw, &header, &pending.response_spec, &self.config) {
            Ok(value) => {
                tracing::trace!(
                    ordinal = header.ordinal,
                    request_id = header.request_id,
                    "Resolved pending call"
                );
                if pending.sender.send(Ok(value)).is_err() {
                    tracing::warn!(request_id = header.request_id, "Reply for a dropped call");
                }
                ControlFlow::Continue(())
            }
            Err(e) => {
                let err: BindingError = e.into();
                let _ = pending.sender.send(Err(err.clone()));
                self.fail(err)
            }
        }
    }

    fn answer_control(&self, header: &MessageHeader, raw: RawMessage) -> ControlFlow<()> {
        let reply = match self.control.handle(header, raw, &self.config) {
            Ok(Some(reply)) => reply,
            Ok(None) => return ControlFlow::Continue(()),
            Err(e) => return self.fail(e),
        };
        let written = {
            let state = self.lock();
            match state.handle.as_ref() {
                Some(handle) => handle.write_raw(reply.into_raw()),
                None => return ControlFlow::Break(()),
            }
        };
        match written {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => self.fail(e.into()),
        }
    }

    /// Close the pipe and reject every pending call with `reason`.
    fn fail(&self, reason: BindingError) -> ControlFlow<()> {
        let (handle, pending) = {
            let mut state = self.lock();
            if let Some(token) = state.reader_cancel.take() {
                token.cancel();
            }
            (state.handle.take(), std::mem::take(&mut state.pending))
        };

        tracing::error!(error = %reason, pending = pending.len(), "Proxy connection error");
        drop(handle);

        let reason = reason.to_string();
        for (_, entry) in pending {
            let _ = entry
                .sender
                .send(Err(BindingError::ConnectionError(reason.clone())));
        }
        ControlFlow::Break(())
    }
}

/// Result of [`InterfaceProxy::call`]. Resolves to `None` for calls without a
/// reply type, and to the decoded reply otherwise.
pub struct PendingCall {
    request_id: Option<u64>,
    receiver: Option<oneshot::Receiver<Result<StructValue, BindingError>>>,
}

impl PendingCall {
    pub fn request_id(&self) -> Option<u64> {
        self.request_id
    }
}

impl Future for PendingCall {
    type Output = Result<Option<StructValue>, BindingError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(receiver) = this.receiver.as_mut() else {
            return Poll::Ready(Ok(None));
        };
        Pin::new(receiver).poll(cx).map(|reply| match reply {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(BindingError::Cancelled),
        })
    }
}

pub struct InterfaceProxy {
    shared: Arc<ProxyShared>,
}

impl Default for InterfaceProxy {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceProxy {
    pub fn new() -> Self {
        Self::with_config(BindingConfig::default())
    }

    pub fn with_config(config: BindingConfig) -> Self {
        Self {
            shared: Arc::new(ProxyShared {
                state: StdMutex::new(ProxyState::default()),
                config,
                control: ControlMessageHandler::default(),
            }),
        }
    }

    /// Proxy already bound to `handle`. Must be called within a tokio runtime.
    pub fn bound(handle: Handle) -> Self {
        let proxy = Self::new();
        // A fresh proxy is never bound.
        let _ = proxy.bind_handle(handle);
        proxy
    }

    /// Attach `handle` and start reading replies from it.
    pub fn bind_handle(&self, handle: Handle) -> Result<(), BindingError> {
        let token = CancellationToken::new();
        let reader = ChannelReader::with_cancellation(&handle, token.clone());
        {
            let mut state = self.shared.lock();
            if state.handle.is_some() {
                return Err(BindingError::AlreadyBound);
            }
            tracing::debug!(endpoint = handle.id(), "Binding proxy");
            state.handle = Some(handle);
            state.reader_cancel = Some(token.clone());
        }

        let weak: Weak<ProxyShared> = Arc::downgrade(&self.shared);
        let on_error = weak.clone();
        tokio::spawn(async move {
            reader
                .run(
                    |raw| match weak.upgrade() {
                        Some(shared) => shared.on_message(raw, &token),
                        None => ControlFlow::Break(()),
                    },
                    |e| {
                        if let Some(shared) = on_error.upgrade() {
                            shared.fail(e.into());
                        }
                    },
                )
                .await;
        });
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.shared.lock().handle.is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().pending.len()
    }

    /// Stop reading and give the handle back. Pending calls are left alone.
    pub fn unbind(&self) -> Option<Handle> {
        let mut state = self.shared.lock();
        if let Some(token) = state.reader_cancel.take() {
            token.cancel();
        }
        let handle = state.handle.take();
        if let Some(handle) = &handle {
            tracing::debug!(endpoint = handle.id(), "Unbound proxy");
        }
        handle
    }

    /// Unbind and hand over the pipe, e.g. to send it inside a message.
    pub fn pass_handle(&self) -> Result<Handle, BindingError> {
        self.unbind().ok_or(BindingError::Unbound)
    }

    /// Send a call with positional `args` matching `params`.
    ///
    /// Encoding and the write both happen before this returns; the returned
    /// future only waits for the reply.
    pub fn call(
        &self,
        ordinal: u32,
        params: &Arc<StructSpec>,
        response: Option<&Arc<StructSpec>>,
        args: Vec<Value>,
    ) -> Result<PendingCall, BindingError> {
        let value = StructValue::from_args(params, args)?;
        self.send(ordinal, params, response, value)
    }

    /// Like [`call`](Self::call) with an already assembled params struct.
    pub fn send(
        &self,
        ordinal: u32,
        params: &Arc<StructSpec>,
        response: Option<&Arc<StructSpec>>,
        mut value: StructValue,
    ) -> Result<PendingCall, BindingError> {
        let mut state = self.shared.lock();
        let request_id = state.next_request_id;
        let header = match response {
            Some(_) => MessageHeader::request(ordinal, request_id),
            None => MessageHeader::new(ordinal, 0, 0),
        };

        let handle = state.handle.as_ref().ok_or(BindingError::Unbound)?;
        let message = serialize_message(header, params, &mut value, &self.shared.config)?;
        handle.write_raw(message.into_raw())?;

        let Some(response_spec) = response else {
            tracing::trace!(ordinal, "Sent one-way message");
            return Ok(PendingCall {
                request_id: None,
                receiver: None,
            });
        };

        let (sender, receiver) = oneshot::channel();
        state.next_request_id += 1;
        state.pending.insert(
            request_id,
            PendingResponse {
                ordinal,
                response_spec: Arc::clone(response_spec),
                sender,
            },
        );
        tracing::trace!(ordinal, request_id, "Sent request");
        Ok(PendingCall {
            request_id: Some(request_id),
            receiver: Some(receiver),
        })
    }

    pub async fn call_typed<P, R>(&self, ordinal: u32, params: P) -> Result<R, BindingError>
    where
        P: MojomStruct,
        R: MojomStruct,
    {
        let params_spec = P::spec()?;
        let response_spec = R::spec()?;
        let reply = self
            .send(ordinal, &params_spec, Some(&response_spec), params.into_value())?
            .await?
            .ok_or(BindingError::MissingResponse)?;
        Ok(R::from_value(reply)?)
    }

    /// Resolves once the peer has processed everything sent before it.
    pub async fn flush(&self) -> Result<(), BindingError> {
        let types = control_types()?;
        self.send(
            RUN_MESSAGE_ID,
            &types.run_params,
            Some(&types.run_response_params),
            flush_params(),
        )?
        .await?;
        Ok(())
    }

    pub async fn query_version(&self) -> Result<u32, BindingError> {
        let types = control_types()?;
        let reply = self
            .send(
                RUN_MESSAGE_ID,
                &types.run_params,
                Some(&types.run_response_params),
                query_version_params(),
            )?
            .await?
            .ok_or(BindingError::MissingResponse)?;
        Ok(parse_query_version_result(reply)?)
    }
}

impl Drop for InterfaceProxy {
    fn drop(&mut self) {
        if let Some(token) = self.shared.lock().reader_cancel.take() {
            token.cancel();
        }
    }
}
