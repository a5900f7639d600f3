//! Byte-stream bridge for message pipes.
//!
//! Carries the datagrams of one pipe over any `AsyncRead + AsyncWrite` stream
//! (sockets, stdio, in-memory duplex) with a 4-byte length prefix per
//! datagram. Handles cannot travel over a stream.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::config::BindingConfig;
use crate::error::ChannelError;
use crate::pipe::{Handle, create_message_pipe};
use crate::reader::{ChannelReader, ReadEvent};

fn frame_codec(config: &BindingConfig) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(config.max_frame_bytes)
        .new_codec()
}

fn transport_error(e: std::io::Error) -> ChannelError {
    ChannelError::Transport(e.to_string())
}

/// Connect `io` to a fresh message pipe and return the pipe's other end.
///
/// Datagrams written to the returned handle are sent as frames; frames read
/// from `io` arrive on it as datagrams. The bridge stops, closing the pipe,
/// when the stream ends or fails, when the handle is closed, or when a
/// datagram carries handles. Must be called within a tokio runtime.
pub fn bridge_stream<T>(io: T, config: &BindingConfig) -> (Handle, JoinHandle<()>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (local, remote) = create_message_pipe();
    let (read_half, write_half) = tokio::io::split(io);
    let inbound = FramedRead::new(read_half, frame_codec(config));
    let outbound = FramedWrite::new(write_half, frame_codec(config));
    tracing::debug!(endpoint = local.id(), "Starting stream bridge");
    let task = tokio::spawn(pump(local, inbound, outbound));
    (remote, task)
}

async fn pump<R, W>(
    pipe: Handle,
    mut inbound: FramedRead<R, LengthDelimitedCodec>,
    mut outbound: FramedWrite<W, LengthDelimitedCodec>,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let endpoint = pipe.id();
    let mut reader = ChannelReader::new(&pipe);

    let outcome = tokio::select! {
        result = pipe_to_stream(&mut reader, &mut outbound) => result,
        result = stream_to_pipe(&pipe, &mut inbound) => result,
    };

    match outcome {
        Ok(()) | Err(ChannelError::PeerClosed) => {
            tracing::debug!(endpoint, "Stream bridge closed");
        }
        Err(e) => tracing::error!(endpoint, error = %e, "Stream bridge failed"),
    }

    reader.stop();
    drop(pipe);
    // Let the far side see end of stream.
    if let Err(e) = SinkExt::<Bytes>::close(&mut outbound).await {
        tracing::debug!(endpoint, error = %e, "Failed to shut down stream");
    }
}

async fn pipe_to_stream<W>(
    reader: &mut ChannelReader,
    outbound: &mut FramedWrite<W, LengthDelimitedCodec>,
) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(event) = reader.next_event().await {
        match event {
            ReadEvent::Message(raw) => {
                if !raw.handles.is_empty() {
                    return Err(ChannelError::Transport(format!(
                        "cannot send {} handle(s) over a byte stream",
                        raw.handles.len()
                    )));
                }
                tracing::trace!(bytes = raw.bytes.len(), "Writing frame");
                outbound
                    .send(Bytes::from(raw.bytes))
                    .await
                    .map_err(transport_error)?;
            }
            ReadEvent::Error(e) => return Err(e),
        }
    }
    Ok(())
}

async fn stream_to_pipe<R>(
    pipe: &Handle,
    inbound: &mut FramedRead<R, LengthDelimitedCodec>,
) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    while let Some(frame) = inbound.next().await {
        let frame = frame.map_err(transport_error)?;
        tracing::trace!(bytes = frame.len(), "Read frame");
        pipe.write_message(frame.to_vec(), Vec::new())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::error::BindingError;
    use crate::proxy::InterfaceProxy;
    use crate::target::InterfaceTarget;
    use crate::types::{ArraySpec, StructSpec, Type};
    use crate::value::{StructValue, Value};

    fn bridged_pair(config: &BindingConfig) -> (Handle, Handle, JoinHandle<()>, JoinHandle<()>) {
        let (a_io, b_io) = tokio::io::duplex(64 * 1024);
        let (a, a_task) = bridge_stream(a_io, config);
        let (b, b_task) = bridge_stream(b_io, config);
        (a, b, a_task, b_task)
    }

    async fn next_event(handle: &Handle) -> Option<ReadEvent> {
        ChannelReader::new(handle).next_event().await
    }

    #[tokio::test]
    async fn datagrams_cross_the_stream_in_order() {
        let (a, b, _, _) = bridged_pair(&BindingConfig::default());
        a.write_message(vec![1, 2, 3], Vec::new()).unwrap();
        a.write_message(Vec::new(), Vec::new()).unwrap();
        a.write_message(vec![9; 300], Vec::new()).unwrap();

        let mut reader = ChannelReader::new(&b);
        let mut lengths = Vec::new();
        for _ in 0..3 {
            match reader.next_event().await {
                Some(ReadEvent::Message(raw)) => lengths.push(raw.bytes.len()),
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert_eq!(lengths, vec![3, 0, 300]);
    }

    #[tokio::test]
    async fn closing_one_end_closes_the_other() {
        let (a, b, a_task, b_task) = bridged_pair(&BindingConfig::default());
        a.close();

        assert!(matches!(
            next_event(&b).await,
            Some(ReadEvent::Error(ChannelError::PeerClosed))
        ));
        a_task.await.unwrap();
        b_task.await.unwrap();
    }

    #[tokio::test]
    async fn handles_are_not_transferable() {
        let (a, _b, a_task, _) = bridged_pair(&BindingConfig::default());
        let (spare, _other) = create_message_pipe();
        a.write_message(vec![0; 8], vec![spare]).unwrap();

        a_task.await.unwrap();
        assert_eq!(a.read_message().unwrap_err(), ChannelError::PeerClosed);
    }

    #[tokio::test]
    async fn oversized_frames_stop_the_bridge() {
        let config = BindingConfig::default().with_max_frame_bytes(16);
        let (a, b, a_task, _) = bridged_pair(&config);
        a.write_message(vec![0; 32], Vec::new()).unwrap();

        a_task.await.unwrap();
        assert!(matches!(
            next_event(&b).await,
            Some(ReadEvent::Error(ChannelError::PeerClosed))
        ));
    }

    #[tokio::test]
    async fn proxy_and_target_talk_over_a_stream() {
        let values = ArraySpec::new(Type::Int32, false).unwrap();
        let params = StructSpec::builder("SumParams", 8)
            .field("values", 0, 0, Type::Array(values), false)
            .build()
            .unwrap();
        let response = StructSpec::builder("SumResponse", 8)
            .field("total", 0, 0, Type::Int64, false)
            .build()
            .unwrap();

        let target = InterfaceTarget::new().with_version(2);
        target.register_handler(
            0,
            Arc::clone(&params),
            Some(Arc::clone(&response)),
            |args: Vec<Value>| async move {
                let total = match &args[0] {
                    Value::Array(values) => values
                        .iter()
                        .map(|v| match v {
                            Value::Int32(n) => i64::from(*n),
                            _ => 0,
                        })
                        .sum(),
                    _ => 0i64,
                };
                Ok(Some(StructValue::new().with("total", total)))
            },
        );

        let (a, b, _, _) = bridged_pair(&BindingConfig::default());
        target.bind_handle(b);
        let proxy = InterfaceProxy::bound(a);

        let reply = proxy
            .call(
                0,
                &params,
                Some(&response),
                vec![Value::from(vec![1i32, 2, 3, 4])],
            )
            .unwrap()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.get("total"), Some(&Value::Int64(10)));
        assert_eq!(proxy.query_version().await, Ok(2));

        target.close();
        let after_close = proxy
            .call(0, &params, Some(&response), vec![Value::from(vec![1i32])])
            .unwrap()
            .await;
        assert!(matches!(after_close, Err(BindingError::ConnectionError(_))));
    }
}
