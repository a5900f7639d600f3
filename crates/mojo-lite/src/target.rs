//! Interface target: the server side of one or more pipes.
//!
//! Handlers are registered per ordinal and shared by every bound handle. Each
//! handle gets its own serve task that decodes requests, runs handlers
//! concurrently and writes replies as they complete. A handler failure, a
//! missing reply or any malformed message ends the session for that handle:
//! the task stops reading and closes it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use futures::stream::FuturesUnordered;
use tokio_util::sync::CancellationToken;

use crate::config::BindingConfig;
use crate::control::ControlMessageHandler;
use crate::error::{BindingError, HandlerError};
use crate::message::{Message, MessageHeader, decode_message_payload, serialize_message};
use crate::pipe::{Handle, RawMessage};
use crate::reader::{ChannelReader, ReadEvent};
use crate::types::StructSpec;
use crate::value::{MojomStruct, StructValue, Value};

/// Handles one inbound message kind.
///
/// Receives the decoded params as positional arguments in field order. The
/// returned struct is the reply; `None` is only valid for one-way messages.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, args: Vec<Value>) -> Result<Option<StructValue>, HandlerError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<StructValue>, HandlerError>> + Send + 'static,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Option<StructValue>, HandlerError> {
        (self)(args).await
    }
}

struct TypedHandler<P, R, F> {
    params: Arc<StructSpec>,
    handler: F,
    _types: std::marker::PhantomData<fn(P) -> R>,
}

#[async_trait]
impl<P, R, F, Fut> MessageHandler for TypedHandler<P, R, F>
where
    P: MojomStruct + Send + 'static,
    R: MojomStruct + Send + 'static,
    F: Fn(P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
{
    async fn handle(&self, args: Vec<Value>) -> Result<Option<StructValue>, HandlerError> {
        let value = StructValue::from_args(&self.params, args)
            .map_err(|e| HandlerError::new(e.to_string()))?;
        let params = P::from_value(value).map_err(|e| HandlerError::new(e.to_string()))?;
        let reply = (self.handler)(params).await?;
        Ok(Some(reply.into_value()))
    }
}

struct RegisteredHandler {
    params: Arc<StructSpec>,
    response: Option<Arc<StructSpec>>,
    handler: Arc<dyn MessageHandler>,
}

type ReplyFuture = BoxFuture<'static, Result<Option<Message>, BindingError>>;

enum Dispatch {
    Reply(Message),
    Pending(ReplyFuture),
    Ignored,
}

async fn run_handler(
    registered: Arc<RegisteredHandler>,
    args: Vec<Value>,
    header: MessageHeader,
    config: BindingConfig,
) -> Result<Option<Message>, BindingError> {
    let result = AssertUnwindSafe(registered.handler.handle(args))
        .catch_unwind()
        .await
        .map_err(|payload| HandlerError::new(panic_message(payload)))??;
    let Some(response_spec) = registered.response.as_ref() else {
        return Ok(None);
    };
    let mut value = result.ok_or(BindingError::MissingResponse)?;
    let reply = serialize_message(
        MessageHeader::response(header.ordinal, header.request_id),
        response_spec,
        &mut value,
        &config,
    )?;
    Ok(Some(reply))
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".into()
    }
}

struct TargetShared {
    handlers: DashMap<u32, Arc<RegisteredHandler>>,
    bindings: DashMap<u64, CancellationToken>,
    config: BindingConfig,
    control: ControlMessageHandler,
}

impl TargetShared {
    fn dispatch(&self, raw: RawMessage) -> Result<Dispatch, BindingError> {
        let header = MessageHeader::parse(&raw.bytes)?;
        if header.is_response() {
            return Err(BindingError::UnexpectedMessage(
                "received unexpected response on interface target",
            ));
        }

        if ControlMessageHandler::is_control_message(&header) {
            return Ok(match self.control.handle(&header, raw, &self.config)? {
                Some(reply) => Dispatch::Reply(reply),
                None => Dispatch::Ignored,
            });
        }

        let registered = self
            .handlers
            .get(&header.ordinal)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(BindingError::UnknownOrdinal(header.ordinal))?;

        if header.expects_response() != registered.response.is_some() {
            return Err(BindingError::UnexpectedMessage(
                "message reply flags do not match its handler",
            ));
        }

        let params = decode_message_payload(raw, &header, &registered.params, &self.config)?;
        let args = params.into_args(&registered.params);
        tracing::debug!(
            ordinal = header.ordinal,
            request_id = header.request_id,
            "Dispatching message"
        );

        Ok(Dispatch::Pending(Box::pin(run_handler(
            registered,
            args,
            header,
            self.config.clone(),
        ))))
    }

    async fn serve(self: Arc<Self>, handle: Handle, token: CancellationToken) {
        let endpoint = handle.id();
        let mut reader = ChannelReader::with_cancellation(&handle, token);
        let mut replies: FuturesUnordered<ReplyFuture> = FuturesUnordered::new();

        let outcome: Result<(), BindingError> = loop {
            tokio::select! {
                biased;

                Some(reply) = replies.next(), if !replies.is_empty() => {
                    match reply {
                        Ok(Some(message)) => {
                            if let Err(e) = handle.write_raw(message.into_raw()) {
                                break Err(e.into());
                            }
                        }
                        Ok(None) => {}
                        Err(e) => break Err(e),
                    }
                }

                event = reader.next_event() => {
                    match event {
                        None => break Ok(()),
                        Some(ReadEvent::Error(e)) => break Err(e.into()),
                        Some(ReadEvent::Message(raw)) => match self.dispatch(raw) {
                            Ok(Dispatch::Reply(message)) => {
                                if let Err(e) = handle.write_raw(message.into_raw()) {
                                    break Err(e.into());
                                }
                            }
                            Ok(Dispatch::Pending(reply)) => replies.push(reply),
                            Ok(Dispatch::Ignored) => {}
                            Err(e) => break Err(e),
                        },
                    }
                }
            }
        };

        self.bindings.remove(&endpoint);
        match outcome {
            Ok(()) => tracing::debug!(endpoint, "Target binding closed"),
            Err(e) => tracing::error!(endpoint, error = %e, "Target binding failed, closing handle"),
        }
        drop(handle);
    }
}

/// Server side of an interface. Cheap to clone; clones share handlers and bindings.
#[derive(Clone)]
pub struct InterfaceTarget {
    shared: Arc<TargetShared>,
}

impl Default for InterfaceTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl InterfaceTarget {
    pub fn new() -> Self {
        Self::with_config(BindingConfig::default())
    }

    pub fn with_config(config: BindingConfig) -> Self {
        Self::build(config, 0)
    }

    /// Version reported to peers that query it. Call before binding.
    pub fn with_version(self, version: u32) -> Self {
        Self::build(self.shared.config.clone(), version).with_handlers_from(&self)
    }

    fn build(config: BindingConfig, version: u32) -> Self {
        Self {
            shared: Arc::new(TargetShared {
                handlers: DashMap::new(),
                bindings: DashMap::new(),
                config,
                control: ControlMessageHandler::new(version),
            }),
        }
    }

    fn with_handlers_from(self, other: &InterfaceTarget) -> Self {
        for entry in other.shared.handlers.iter() {
            self.shared
                .handlers
                .insert(*entry.key(), Arc::clone(entry.value()));
        }
        self
    }

    /// Register `handler` for `ordinal`. A `response` spec means callers
    /// expect a reply and the handler must produce one.
    pub fn register_handler<F, Fut>(
        &self,
        ordinal: u32,
        params: Arc<StructSpec>,
        response: Option<Arc<StructSpec>>,
        handler: F,
    ) where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<StructValue>, HandlerError>> + Send + 'static,
    {
        self.register_message_handler(ordinal, params, response, Arc::new(handler));
    }

    pub fn register_message_handler(
        &self,
        ordinal: u32,
        params: Arc<StructSpec>,
        response: Option<Arc<StructSpec>>,
        handler: Arc<dyn MessageHandler>,
    ) {
        let registered = RegisteredHandler {
            params,
            response,
            handler,
        };
        if self
            .shared
            .handlers
            .insert(ordinal, Arc::new(registered))
            .is_some()
        {
            tracing::debug!(ordinal, "Replaced message handler");
        }
    }

    /// Register a handler over typed params and reply structs.
    pub fn register_typed<P, R, F, Fut>(&self, ordinal: u32, handler: F) -> Result<(), BindingError>
    where
        P: MojomStruct + Send + 'static,
        R: MojomStruct + Send + 'static,
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, HandlerError>> + Send + 'static,
    {
        let params = P::spec()?;
        let response = R::spec()?;
        self.register_message_handler(
            ordinal,
            Arc::clone(&params),
            Some(response),
            Arc::new(TypedHandler::<P, R, F> {
                params,
                handler,
                _types: std::marker::PhantomData,
            }),
        );
        Ok(())
    }

    /// Start serving requests arriving on `handle`. Must be called within a
    /// tokio runtime.
    pub fn bind_handle(&self, handle: Handle) {
        let token = CancellationToken::new();
        tracing::debug!(endpoint = handle.id(), "Binding target");
        self.shared.bindings.insert(handle.id(), token.clone());
        tokio::spawn(Arc::clone(&self.shared).serve(handle, token));
    }

    pub fn bound_count(&self) -> usize {
        self.shared.bindings.len()
    }

    /// Stop every binding and close its handle.
    pub fn close(&self) {
        for entry in self.shared.bindings.iter() {
            entry.value().cancel();
        }
    }
}
