//! TCP listener workers connect back to. Every connection is one stream of a worker: it
//! starts with `StartStream`, after which frames are pumped between the socket and the
//! worker's channel pair.

use {
    std::{io, net::SocketAddr, sync::Arc},
    tracing::{debug, info, warn},
    tokio::{io::AsyncWriteExt, net::{TcpListener, TcpStream}},
    tokio_util::sync::CancellationToken,
    fx_rpc::{Content, read_message, write_message},
    crate::{channels::WorkerChannels, error::StreamError},
};

pub struct RpcServer {
    listener: TcpListener,
    channels: Arc<WorkerChannels>,
}

impl RpcServer {
    pub async fn bind(address: &str, channels: Arc<WorkerChannels>) -> io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            channels,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!("rpc server listening on {addr}");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(v) => v,
                    Err(err) => {
                        warn!("failed to accept worker connection: {err:?}");
                        continue;
                    }
                },
            };

            let channels = self.channels.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    result = handle_stream(stream, channels) => if let Err(err) = result {
                        warn!("worker stream from {peer} failed: {err}");
                    },
                    _ = cancel.cancelled() => {},
                }
            });
        }
    }
}

async fn handle_stream(stream: TcpStream, channels: Arc<WorkerChannels>) -> Result<(), StreamError> {
    stream.set_nodelay(true).map_err(fx_rpc::CodecError::from)?;
    let (mut reader, mut writer) = stream.into_split();

    let Some(first) = read_message(&mut reader).await? else {
        return Ok(());
    };
    let worker_id = match &first.content {
        Content::StartStream(start) => start.worker_id.clone(),
        other => return Err(StreamError::UnexpectedFirstMessage { case: other.case().to_string() }),
    };
    let pair = channels.try_get_channels(&worker_id)
        .ok_or_else(|| StreamError::UnknownWorker { worker_id: worker_id.clone() })?;

    pair.stream_opened();
    debug!(worker_id, "worker stream opened");
    if pair.send_inbound(first).is_err() {
        pair.stream_closed();
        return Ok(());
    }

    let outbound = pair.outbound_reader();
    let writer_task = {
        let worker_id = worker_id.clone();
        let pair = pair.clone();
        tokio::spawn(async move {
            while let Ok(message) = outbound.recv_async().await {
                if let Err(err) = write_message(&mut writer, &message).await {
                    // the message is already dequeued, whoever waits for its answer would hang
                    warn!(worker_id, "failed to write {} to worker stream: {err}", message.case());
                    pair.fail(format!("failed to write to worker stream: {err}"));
                    break;
                }
            }
            let _ = writer.shutdown().await;
        })
    };

    let result = loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => if pair.send_inbound(message).is_err() {
                break Ok(());
            },
            Ok(None) => break Ok(()),
            Err(err) => {
                if err.is_protocol_error() {
                    pair.fail(format!("worker sent an invalid frame: {err}"));
                }
                break Err(StreamError::Codec(err));
            }
        }
    };

    // a finished writer would otherwise keep taking messages meant for other streams
    writer_task.abort();
    if pair.stream_closed() == 0 {
        pair.fail("worker closed all streams");
    }
    debug!(worker_id, "worker stream closed");
    result
}

#[cfg(test)]
mod tests {
    use {
        tokio::net::TcpStream,
        fx_rpc::{InvocationCancel, StartStream, StreamingMessage, WorkerHeartbeat},
        super::*,
    };

    async fn start_server() -> (Arc<WorkerChannels>, SocketAddr, CancellationToken) {
        let channels = Arc::new(WorkerChannels::new());
        let server = RpcServer::bind("127.0.0.1:0", channels.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));
        (channels, addr, cancel)
    }

    #[tokio::test]
    async fn frames_are_pumped_both_ways() {
        let (channels, addr, cancel) = start_server().await;
        let pair = channels.add_channels("worker-1").unwrap();
        let inbound = pair.take_inbound_reader().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let start = StreamingMessage::new(StartStream { worker_id: "worker-1".to_owned() }).with_request_id("req-1");
        write_message(&mut stream, &start).await.unwrap();
        write_message(&mut stream, &StreamingMessage::new(WorkerHeartbeat::default())).await.unwrap();

        assert_eq!(inbound.recv_async().await.unwrap(), start);
        assert_eq!(inbound.recv_async().await.unwrap().case(), fx_rpc::ContentCase::WorkerHeartbeat);

        let cancel_message = StreamingMessage::new(InvocationCancel { invocation_id: "abc".to_owned() });
        pair.send_outbound(cancel_message.clone()).unwrap();
        assert_eq!(read_message(&mut stream).await.unwrap(), Some(cancel_message));

        cancel.cancel();
    }

    #[tokio::test]
    async fn closing_last_stream_fails_the_pair() {
        let (channels, addr, cancel) = start_server().await;
        let pair = channels.add_channels("worker-1").unwrap();
        let inbound = pair.take_inbound_reader().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &StreamingMessage::new(StartStream { worker_id: "worker-1".to_owned() })).await.unwrap();
        assert!(inbound.recv_async().await.is_ok());
        drop(stream);

        assert!(inbound.recv_async().await.is_err());
        assert_eq!(pair.fault_reason().as_deref(), Some("worker closed all streams"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn garbage_frame_fails_the_pair() {
        let (channels, addr, cancel) = start_server().await;
        let pair = channels.add_channels("worker-1").unwrap();
        let inbound = pair.take_inbound_reader().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &StreamingMessage::new(StartStream { worker_id: "worker-1".to_owned() })).await.unwrap();
        stream.write_u32(2).await.unwrap();
        stream.write_all(&[0xc1, 0xc1]).await.unwrap();

        assert!(inbound.recv_async().await.is_ok());
        assert!(inbound.recv_async().await.is_err());
        assert!(pair.fault_reason().unwrap().contains("invalid frame"));
        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_write_fails_the_pair() {
        let (channels, addr, cancel) = start_server().await;
        let pair = channels.add_channels("worker-1").unwrap();
        let inbound = pair.take_inbound_reader().unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &StreamingMessage::new(StartStream { worker_id: "worker-1".to_owned() })).await.unwrap();
        assert!(inbound.recv_async().await.is_ok());

        let oversized = StreamingMessage::new(InvocationCancel { invocation_id: "x".repeat(fx_rpc::MAX_FRAME_SIZE + 16) });
        pair.send_outbound(oversized).unwrap();

        assert!(inbound.recv_async().await.is_err());
        assert!(pair.is_completed());
        assert!(pair.fault_reason().unwrap().contains("failed to write"));
        assert!(pair.send_outbound(StreamingMessage::new(InvocationCancel { invocation_id: "abc".to_owned() })).is_err());
        cancel.cancel();
    }

    #[tokio::test]
    async fn stream_for_unknown_worker_is_closed() {
        let (_channels, addr, cancel) = start_server().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        write_message(&mut stream, &StreamingMessage::new(StartStream { worker_id: "unknown".to_owned() })).await.unwrap();
        assert!(matches!(read_message(&mut stream).await, Ok(None) | Err(_)));
        cancel.cancel();
    }
}
