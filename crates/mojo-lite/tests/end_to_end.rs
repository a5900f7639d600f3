//! Proxy and target talking through the public API.

use std::sync::{Arc, OnceLock};

use tokio::sync::Notify;

use mojo_lite::{
    ArraySpec, BindingConfig, BindingError, DecodeError, HandlerError, InterfaceProxy,
    InterfaceTarget, MapSpec, MojomStruct, SpecError, StructSpec, StructValue, Type, UnionSpec,
    Value, bridge_stream, create_message_pipe,
};

fn profile_spec() -> Arc<StructSpec> {
    let tags = ArraySpec::new(Type::String, false).unwrap();
    let scores = MapSpec::new(Type::String, Type::Int32, false).unwrap();
    StructSpec::builder("Profile", 40)
        .field("id", 0, 0, Type::Uint64, false)
        .field("active", 8, 0, Type::Bool, false)
        .field("admin", 8, 1, Type::Bool, false)
        .field("level", 12, 0, Type::Enum, false)
        .field("name", 16, 0, Type::String, false)
        .field("tags", 24, 0, Type::Array(tags), true)
        .field("scores", 32, 0, Type::Map(scores), false)
        .build()
        .unwrap()
}

fn update_spec() -> Arc<StructSpec> {
    let choice = UnionSpec::builder("Choice")
        .field("count", 0, Type::Uint32, false)
        .field("label", 1, Type::String, false)
        .build()
        .unwrap();
    StructSpec::builder("Update", 24)
        .field("profile", 0, 0, Type::Struct(profile_spec()), false)
        .field("choice", 8, 0, Type::Union(choice), false)
        .build()
        .unwrap()
}

fn sample_update() -> StructValue {
    let profile = StructValue::new()
        .with("id", 7u64)
        .with("active", true)
        .with("admin", false)
        .with("level", 3i32)
        .with("name", "ada")
        .with("tags", vec!["x", "yz"])
        .with(
            "scores",
            Value::Map(vec![
                (Value::from("math"), Value::from(9i32)),
                (Value::from("art"), Value::from(4i32)),
            ]),
        );
    StructValue::new()
        .with("profile", profile)
        .with("choice", Value::union("label", "second"))
}

fn echo_target(spec: Arc<StructSpec>) -> InterfaceTarget {
    let target = InterfaceTarget::new();
    let params = Arc::clone(&spec);
    target.register_handler(0, Arc::clone(&spec), Some(spec), move |args: Vec<Value>| {
        let params = Arc::clone(&params);
        async move {
            let value = StructValue::from_args(&params, args)
                .map_err(|e| HandlerError::new(e.to_string()))?;
            Ok(Some(value))
        }
    });
    target
}

#[tokio::test]
async fn nested_values_survive_a_round_trip() {
    let spec = update_spec();
    let target = echo_target(Arc::clone(&spec));
    let (local, remote) = create_message_pipe();
    target.bind_handle(remote);
    let proxy = InterfaceProxy::bound(local);

    let reply = proxy
        .send(0, &spec, Some(&spec), sample_update())
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply, sample_update());

    insta::assert_json_snapshot!(reply, @r#"
    {
      "profile": {
        "id": 7,
        "active": true,
        "admin": false,
        "level": 3,
        "name": "ada",
        "tags": [
          "x",
          "yz"
        ],
        "scores": [
          [
            "math",
            9
          ],
          [
            "art",
            4
          ]
        ]
      },
      "choice": {
        "label": "second"
      }
    }
    "#);
}

#[tokio::test]
async fn nullable_fields_decode_as_null() {
    let spec = update_spec();
    let target = echo_target(Arc::clone(&spec));
    let (local, remote) = create_message_pipe();
    target.bind_handle(remote);
    let proxy = InterfaceProxy::bound(local);

    let mut update = sample_update();
    if let Some(Value::Struct(mut profile)) = update.take("profile") {
        profile.insert("tags", Value::Null);
        update.insert("profile", profile);
    }
    let reply = proxy
        .send(0, &spec, Some(&spec), update)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    match reply.get("profile") {
        Some(Value::Struct(profile)) => assert_eq!(profile.get("tags"), Some(&Value::Null)),
        other => panic!("unexpected profile: {other:?}"),
    }
}

#[tokio::test]
async fn interface_requests_travel_inside_messages() {
    let greeting = StructSpec::builder("Greeting", 8)
        .field("text", 0, 0, Type::String, false)
        .build()
        .unwrap();
    let connect = StructSpec::builder("ConnectParams", 8)
        .field("receiver", 0, 0, Type::InterfaceRequest("Greeter".into()), false)
        .build()
        .unwrap();

    // The factory binds every received request to a greeter.
    let greeter = echo_target(Arc::clone(&greeting));
    let factory = InterfaceTarget::new();
    let bound = greeter.clone();
    factory.register_handler(0, Arc::clone(&connect), None, move |mut args: Vec<Value>| {
        let bound = bound.clone();
        async move {
            match args.pop() {
                Some(Value::Handle(handle)) => {
                    bound.bind_handle(handle);
                    Ok(None)
                }
                _ => Err(HandlerError::new("expected a receiver handle")),
            }
        }
    });

    let (local, remote) = create_message_pipe();
    factory.bind_handle(remote);
    let factory_proxy = InterfaceProxy::bound(local);

    let (greeter_end, receiver) = create_message_pipe();
    factory_proxy
        .call(0, &connect, None, vec![Value::Handle(receiver)])
        .unwrap()
        .await
        .unwrap();

    let greeter_proxy = InterfaceProxy::bound(greeter_end);
    let reply = greeter_proxy
        .call(0, &greeting, Some(&greeting), vec![Value::from("hi")])
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reply.get("text"), Some(&Value::from("hi")));
    assert_eq!(greeter.bound_count(), 1);
}

#[tokio::test]
async fn closing_the_target_rejects_pending_calls() {
    let spec = StructSpec::builder("Wait", 8)
        .field("token", 0, 0, Type::Uint32, false)
        .build()
        .unwrap();
    let never = Arc::new(Notify::new());
    let target = InterfaceTarget::new();
    let held = Arc::clone(&never);
    target.register_handler(0, Arc::clone(&spec), Some(Arc::clone(&spec)), move |_args| {
        let held = Arc::clone(&held);
        async move {
            held.notified().await;
            Ok(None)
        }
    });

    let (local, remote) = create_message_pipe();
    target.bind_handle(remote);
    let proxy = InterfaceProxy::bound(local);

    let first = proxy
        .call(0, &spec, Some(&spec), vec![Value::from(1u32)])
        .unwrap();
    let second = proxy
        .call(0, &spec, Some(&spec), vec![Value::from(2u32)])
        .unwrap();
    proxy.flush().await.unwrap();
    assert_eq!(proxy.pending_count(), 2);

    target.close();
    assert!(matches!(first.await, Err(BindingError::ConnectionError(_))));
    assert!(matches!(second.await, Err(BindingError::ConnectionError(_))));
    assert!(!proxy.is_bound());
    assert!(matches!(
        proxy.call(0, &spec, Some(&spec), vec![Value::from(3u32)]),
        Err(BindingError::Unbound)
    ));
}

struct Add {
    a: i32,
    b: i32,
}

struct Sum {
    total: i64,
}

impl MojomStruct for Add {
    fn spec() -> Result<Arc<StructSpec>, SpecError> {
        static SPEC: OnceLock<Result<Arc<StructSpec>, SpecError>> = OnceLock::new();
        SPEC.get_or_init(|| {
            StructSpec::builder("Add", 8)
                .field("a", 0, 0, Type::Int32, false)
                .field("b", 4, 0, Type::Int32, false)
                .build()
        })
        .clone()
    }

    fn into_value(self) -> StructValue {
        StructValue::new().with("a", self.a).with("b", self.b)
    }

    fn from_value(mut value: StructValue) -> Result<Self, DecodeError> {
        Ok(Self {
            a: value.take_as("Add", "a")?,
            b: value.take_as("Add", "b")?,
        })
    }
}

impl MojomStruct for Sum {
    fn spec() -> Result<Arc<StructSpec>, SpecError> {
        static SPEC: OnceLock<Result<Arc<StructSpec>, SpecError>> = OnceLock::new();
        SPEC.get_or_init(|| {
            StructSpec::builder("Sum", 8)
                .field("total", 0, 0, Type::Int64, false)
                .build()
        })
        .clone()
    }

    fn into_value(self) -> StructValue {
        StructValue::new().with("total", self.total)
    }

    fn from_value(mut value: StructValue) -> Result<Self, DecodeError> {
        Ok(Self {
            total: value.take_as("Sum", "total")?,
        })
    }
}

#[tokio::test]
async fn typed_calls_over_a_byte_stream() {
    let config = BindingConfig::default();
    let (client_io, server_io) = tokio::io::duplex(4096);
    let (client, client_bridge) = bridge_stream(client_io, &config);
    let (server, server_bridge) = bridge_stream(server_io, &config);

    let target = InterfaceTarget::with_config(config.clone()).with_version(4);
    target
        .register_typed(1, |add: Add| async move {
            Ok(Sum {
                total: i64::from(add.a) + i64::from(add.b),
            })
        })
        .unwrap();
    target.bind_handle(server);
    let proxy = InterfaceProxy::with_config(config);
    proxy.bind_handle(client).unwrap();

    let calls = (0..10).map(|i| proxy.call_typed::<Add, Sum>(1, Add { a: i, b: 100 }));
    let sums = futures::future::join_all(calls).await;
    let totals: Vec<i64> = sums.into_iter().map(|s| s.unwrap().total).collect();
    assert_eq!(totals, (100..110).collect::<Vec<i64>>());
    assert_eq!(proxy.query_version().await, Ok(4));

    drop(proxy);
    client_bridge.await.unwrap();
    server_bridge.await.unwrap();
    target.close();
}
