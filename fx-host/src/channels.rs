//! Per-worker pair of unbounded message queues between the RPC streams and the worker channel.
//!
//! Inbound (worker -> host) has many producers, one per open stream, and exactly one consumer.
//! Outbound (host -> worker) has many producers and one consumer per open stream.

use {
    std::{collections::HashMap, sync::{Arc, atomic::{AtomicUsize, Ordering}}},
    tracing::debug,
    parking_lot::{Mutex, RwLock},
    fx_rpc::StreamingMessage,
    crate::error::ChannelError,
};

pub struct ChannelPair {
    worker_id: String,
    inbound_sender: RwLock<Option<flume::Sender<StreamingMessage>>>,
    inbound_receiver: Mutex<Option<flume::Receiver<StreamingMessage>>>,
    outbound_sender: RwLock<Option<flume::Sender<StreamingMessage>>>,
    outbound_receiver: flume::Receiver<StreamingMessage>,
    fault: Mutex<Option<String>>,
    open_streams: AtomicUsize,
}

impl ChannelPair {
    fn new(worker_id: String) -> Self {
        let (inbound_sender, inbound_receiver) = flume::unbounded();
        let (outbound_sender, outbound_receiver) = flume::unbounded();
        Self {
            worker_id,
            inbound_sender: RwLock::new(Some(inbound_sender)),
            inbound_receiver: Mutex::new(Some(inbound_receiver)),
            outbound_sender: RwLock::new(Some(outbound_sender)),
            outbound_receiver,
            fault: Mutex::new(None),
            open_streams: AtomicUsize::new(0),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn send_inbound(&self, message: StreamingMessage) -> Result<(), ChannelError> {
        send(&self.inbound_sender, &self.worker_id, message)
    }

    pub fn send_outbound(&self, message: StreamingMessage) -> Result<(), ChannelError> {
        send(&self.outbound_sender, &self.worker_id, message)
    }

    /// The single inbound consumer. Can be taken once.
    pub fn take_inbound_reader(&self) -> Result<flume::Receiver<StreamingMessage>, ChannelError> {
        self.inbound_receiver.lock().take()
            .ok_or_else(|| ChannelError::InboundReaderTaken { worker_id: self.worker_id.clone() })
    }

    /// One of the outbound consumers. Every message is received by exactly one of them.
    pub fn outbound_reader(&self) -> flume::Receiver<StreamingMessage> {
        self.outbound_receiver.clone()
    }

    /// Stops accepting messages in both directions. Already queued messages stay readable.
    pub fn complete(&self) {
        self.inbound_sender.write().take();
        self.outbound_sender.write().take();
    }

    /// Completes the pair, recording why. The first reason wins.
    pub fn fail(&self, reason: impl Into<String>) {
        {
            let mut fault = self.fault.lock();
            if fault.is_none() {
                *fault = Some(reason.into());
            }
        }
        self.complete();
    }

    pub fn fault_reason(&self) -> Option<String> {
        self.fault.lock().clone()
    }

    pub fn is_completed(&self) -> bool {
        self.inbound_sender.read().is_none()
    }

    pub fn stream_opened(&self) {
        self.open_streams.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of streams still open.
    pub fn stream_closed(&self) -> usize {
        self.open_streams.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }
}

fn send(
    sender: &RwLock<Option<flume::Sender<StreamingMessage>>>,
    worker_id: &str,
    message: StreamingMessage,
) -> Result<(), ChannelError> {
    let completed = || ChannelError::Completed { worker_id: worker_id.to_owned() };
    let sender = sender.read();
    let sender = sender.as_ref().ok_or_else(completed)?;
    sender.send(message).map_err(|_| completed())
}

/// Registry of channel pairs by worker id.
pub struct WorkerChannels {
    pairs: Mutex<HashMap<String, Arc<ChannelPair>>>,
}

impl WorkerChannels {
    pub fn new() -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_channels(&self, worker_id: &str) -> Result<Arc<ChannelPair>, ChannelError> {
        let mut pairs = self.pairs.lock();
        if pairs.contains_key(worker_id) {
            return Err(ChannelError::DuplicateWorkerId { worker_id: worker_id.to_owned() });
        }
        let pair = Arc::new(ChannelPair::new(worker_id.to_owned()));
        pairs.insert(worker_id.to_owned(), pair.clone());
        debug!(worker_id, "added worker channels");
        Ok(pair)
    }

    /// Completes and forgets the pair. Returns false if there was nothing to remove.
    pub fn remove_channels(&self, worker_id: &str) -> bool {
        let pair = self.pairs.lock().remove(worker_id);
        match pair {
            Some(pair) => {
                pair.complete();
                debug!(worker_id, "removed worker channels");
                true
            },
            None => false,
        }
    }

    pub fn try_get_channels(&self, worker_id: &str) -> Option<Arc<ChannelPair>> {
        self.pairs.lock().get(worker_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.pairs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use {
        fx_rpc::{InvocationCancel, WorkerHeartbeat},
        super::*,
    };

    fn heartbeat() -> StreamingMessage {
        StreamingMessage::new(WorkerHeartbeat::default())
    }

    #[test]
    fn duplicate_worker_id_keeps_existing_pair() {
        let channels = WorkerChannels::new();
        let pair = channels.add_channels("worker-1").unwrap();

        assert_eq!(
            channels.add_channels("worker-1").err(),
            Some(ChannelError::DuplicateWorkerId { worker_id: "worker-1".to_owned() })
        );

        pair.send_inbound(heartbeat()).unwrap();
        let existing = channels.try_get_channels("worker-1").unwrap();
        assert!(Arc::ptr_eq(&pair, &existing));
        assert_eq!(existing.take_inbound_reader().unwrap().try_recv().unwrap(), heartbeat());
    }

    #[tokio::test]
    async fn remove_is_idempotent_and_keeps_queued_messages() {
        let channels = WorkerChannels::new();
        let pair = channels.add_channels("worker-1").unwrap();
        let inbound = pair.take_inbound_reader().unwrap();
        let outbound = pair.outbound_reader();

        pair.send_inbound(heartbeat()).unwrap();
        pair.send_outbound(StreamingMessage::new(InvocationCancel { invocation_id: "abc".to_owned() })).unwrap();

        assert!(channels.remove_channels("worker-1"));
        assert!(!channels.remove_channels("worker-1"));
        assert!(channels.try_get_channels("worker-1").is_none());

        assert!(matches!(pair.send_inbound(heartbeat()), Err(ChannelError::Completed { .. })));
        assert!(pair.send_outbound(heartbeat()).is_err());

        assert_eq!(inbound.recv_async().await.unwrap(), heartbeat());
        assert!(inbound.recv_async().await.is_err());
        assert!(outbound.recv_async().await.is_ok());
        assert!(outbound.recv_async().await.is_err());
    }

    #[test]
    fn inbound_reader_is_taken_once() {
        let channels = WorkerChannels::new();
        let pair = channels.add_channels("worker-1").unwrap();
        assert!(pair.take_inbound_reader().is_ok());
        assert_eq!(
            pair.take_inbound_reader().err(),
            Some(ChannelError::InboundReaderTaken { worker_id: "worker-1".to_owned() })
        );
    }

    #[test]
    fn first_fault_reason_is_kept() {
        let channels = WorkerChannels::new();
        let pair = channels.add_channels("worker-1").unwrap();
        pair.fail("bad frame");
        pair.fail("second reason");
        assert!(pair.is_completed());
        assert_eq!(pair.fault_reason().as_deref(), Some("bad frame"));
    }

    #[test]
    fn each_outbound_message_goes_to_one_reader() {
        let channels = WorkerChannels::new();
        let pair = channels.add_channels("worker-1").unwrap();
        let first = pair.outbound_reader();
        let second = pair.outbound_reader();

        pair.send_outbound(heartbeat()).unwrap();
        let received = first.try_recv().is_ok() as usize + second.try_recv().is_ok() as usize;
        assert_eq!(received, 1);
    }
}
