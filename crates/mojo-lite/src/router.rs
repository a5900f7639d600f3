//! Listener fan-out for interface targets.
//!
//! An [`InterfaceCallbackTarget`] collects listeners for one message and turns
//! them into a [`MessageHandler`]. Listener ids come from a [`CallbackRouter`]
//! shared by every callback target of an interface, so a single id removes a
//! listener wherever it was added.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::HandlerError;
use crate::target::MessageHandler;
use crate::value::{StructValue, Value};

/// Receives the params of a message. Returns the reply, if this listener
/// answers the message.
pub type Listener = Arc<dyn Fn(&[Value]) -> Option<StructValue> + Send + Sync>;

type Remover = Box<dyn Fn() -> bool + Send + Sync>;

#[derive(Default)]
struct RouterInner {
    next_listener_id: AtomicU64,
    removers: DashMap<u64, Remover>,
}

/// Hands out listener ids and removes listeners by id.
#[derive(Clone, Default)]
pub struct CallbackRouter {
    inner: Arc<RouterInner>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Remove the listener registered under `id`. Returns whether it existed.
    pub fn remove_listener(&self, id: u64) -> bool {
        match self.inner.removers.remove(&id) {
            Some((_, remove)) => {
                let removed = remove();
                tracing::debug!(listener = id, removed, "Removed listener");
                removed
            }
            None => false,
        }
    }

    pub fn listener_count(&self) -> usize {
        self.inner.removers.len()
    }
}

type ListenerMap = StdMutex<BTreeMap<u64, Listener>>;

fn lock(listeners: &ListenerMap) -> MutexGuard<'_, BTreeMap<u64, Listener>> {
    match listeners.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("Listener mutex poisoned - recovering listener map");
            poisoned.into_inner()
        }
    }
}

/// Listeners for one message, dispatched in registration order.
pub struct InterfaceCallbackTarget {
    listeners: Arc<ListenerMap>,
    router: CallbackRouter,
}

impl InterfaceCallbackTarget {
    pub fn new(router: &CallbackRouter) -> Self {
        Self {
            listeners: Arc::new(StdMutex::new(BTreeMap::new())),
            router: router.clone(),
        }
    }

    pub fn add_listener<F>(&self, listener: F) -> u64
    where
        F: Fn(&[Value]) -> Option<StructValue> + Send + Sync + 'static,
    {
        let id = self.router.next_id();
        lock(&self.listeners).insert(id, Arc::new(listener));

        let listeners: Weak<ListenerMap> = Arc::downgrade(&self.listeners);
        self.router.inner.removers.insert(
            id,
            Box::new(move || match listeners.upgrade() {
                Some(listeners) => lock(&listeners).remove(&id).is_some(),
                None => false,
            }),
        );
        id
    }

    /// Shorthand for [`CallbackRouter::remove_listener`].
    pub fn remove_listener(&self, id: u64) -> bool {
        self.router.remove_listener(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.listeners).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handler that runs every listener on each message. With
    /// `expects_response`, at most one listener may reply.
    pub fn create_target_handler(&self, expects_response: bool) -> Arc<dyn MessageHandler> {
        Arc::new(ListenerDispatch {
            listeners: Arc::clone(&self.listeners),
            expects_response,
        })
    }
}

struct ListenerDispatch {
    listeners: Arc<ListenerMap>,
    expects_response: bool,
}

#[async_trait]
impl MessageHandler for ListenerDispatch {
    async fn handle(&self, args: Vec<Value>) -> Result<Option<StructValue>, HandlerError> {
        // Listeners may add or remove listeners; call them unlocked.
        let listeners: Vec<Listener> = lock(&self.listeners).values().cloned().collect();

        let mut reply = None;
        for listener in listeners {
            let Some(value) = listener(&args) else {
                continue;
            };
            if !self.expects_response {
                continue;
            }
            if reply.is_some() {
                return Err(HandlerError::new(
                    "multiple listeners attempted to reply to a message",
                ));
            }
            reply = Some(value);
        }
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::error::BindingError;
    use crate::pipe::create_message_pipe;
    use crate::proxy::InterfaceProxy;
    use crate::target::InterfaceTarget;
    use crate::types::{StructSpec, Type};

    fn name_params() -> Arc<StructSpec> {
        StructSpec::builder("NameParams", 8)
            .field("name", 0, 0, Type::String, false)
            .build()
            .unwrap()
    }

    fn greeting() -> Arc<StructSpec> {
        StructSpec::builder("Greeting", 8)
            .field("greeting", 0, 0, Type::String, false)
            .build()
            .unwrap()
    }

    fn greet(args: &[Value]) -> Option<StructValue> {
        match args.first() {
            Some(Value::String(name)) => {
                Some(StructValue::new().with("greeting", format!("hello {name}")))
            }
            _ => None,
        }
    }

    #[test]
    fn ids_are_unique_across_targets() {
        let router = CallbackRouter::new();
        let first = InterfaceCallbackTarget::new(&router);
        let second = InterfaceCallbackTarget::new(&router);

        let a = first.add_listener(|_| None);
        let b = second.add_listener(|_| None);
        let c = first.add_listener(|_| None);
        assert_eq!((a, b, c), (1, 2, 3));
        assert_eq!(router.listener_count(), 3);

        assert!(router.remove_listener(b));
        assert!(second.is_empty());
        assert_eq!(first.len(), 2);
        assert!(!router.remove_listener(b));
        assert!(!router.remove_listener(99));
    }

    #[tokio::test]
    async fn one_way_dispatch_reaches_every_listener() {
        let router = CallbackRouter::new();
        let target = InterfaceCallbackTarget::new(&router);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            target.add_listener(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Some(StructValue::new())
            });
        }

        let reply = target
            .create_target_handler(false)
            .handle(vec![Value::from("x")])
            .await
            .unwrap();
        assert!(reply.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn single_listener_reply_is_returned() {
        let router = CallbackRouter::new();
        let target = InterfaceCallbackTarget::new(&router);
        target.add_listener(|_| None);
        target.add_listener(greet);

        let reply = target
            .create_target_handler(true)
            .handle(vec![Value::from("ada")])
            .await
            .unwrap();
        insta::assert_json_snapshot!(reply, @r#"
        {
          "greeting": "hello ada"
        }
        "#);
    }

    #[tokio::test]
    async fn second_reply_is_an_error() {
        let router = CallbackRouter::new();
        let target = InterfaceCallbackTarget::new(&router);
        target.add_listener(greet);
        let duplicate = target.add_listener(greet);
        let handler = target.create_target_handler(true);

        let err = handler.handle(vec![Value::from("ada")]).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "multiple listeners attempted to reply to a message"
        );

        target.remove_listener(duplicate);
        assert!(handler.handle(vec![Value::from("ada")]).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn serves_calls_through_a_target() {
        let router = CallbackRouter::new();
        let callbacks = InterfaceCallbackTarget::new(&router);
        let listener = callbacks.add_listener(greet);

        let target = InterfaceTarget::new();
        target.register_message_handler(
            0,
            name_params(),
            Some(greeting()),
            callbacks.create_target_handler(true),
        );
        let (local, remote) = create_message_pipe();
        target.bind_handle(remote);
        let proxy = InterfaceProxy::bound(local);

        let reply = proxy
            .call(0, &name_params(), Some(&greeting()), vec![Value::from("bob")])
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.get("greeting"), Some(&Value::from("hello bob")));

        // No listener left to reply, so the target drops the connection.
        router.remove_listener(listener);
        let result = proxy
            .call(0, &name_params(), Some(&greeting()), vec![Value::from("bob")])
            .unwrap()
            .await;
        assert!(matches!(result, Err(BindingError::ConnectionError(_))));
    }
}
