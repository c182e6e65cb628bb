use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex,
};

use anyhow::bail;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rtc_integration::{
    LocalMediaStream, MediaDevices, PeerConnectionEvent, PeerConnectionFactory,
    PeerConnectionSession,
};
use shared::{
    domain::{MessageId, UserId},
    protocol::{ClientRequest, MessagePayload, ParticipantRef, SessionDescription},
};
use tokio::sync::{broadcast, Notify};

use crate::transport::EventSink;

/// Captures outbound events; can pretend the channel is down.
#[derive(Default)]
pub(crate) struct RecordingSink {
    sent: Mutex<Vec<ClientRequest>>,
    offline: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn sent(&self) -> Vec<ClientRequest> {
        self.sent.lock().expect("sent").clone()
    }

    pub(crate) fn names(&self) -> Vec<&'static str> {
        self.sent().iter().map(ClientRequest::name).collect()
    }

    pub(crate) fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, request: ClientRequest) -> bool {
        if self.offline.load(Ordering::SeqCst) {
            return false;
        }
        self.sent.lock().expect("sent").push(request);
        true
    }
}

pub(crate) fn message_payload(id: &str, from: &str, to: &str, content: &str) -> MessagePayload {
    MessagePayload {
        id: MessageId::from(id),
        from: ParticipantRef::Id(UserId::from(from)),
        to: ParticipantRef::Id(UserId::from(to)),
        content: Some(content.to_string()),
        image: None,
        file: None,
        created_at: Utc
            .with_ymd_and_hms(2024, 1, 1, 12, 0, 0)
            .single()
            .expect("timestamp"),
        delivered: false,
        read: false,
    }
}

pub(crate) struct MockStream {
    stops: Arc<AtomicUsize>,
}

impl LocalMediaStream for MockStream {
    fn stream_id(&self) -> &str {
        "local-mic"
    }

    fn stop_tracks(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub(crate) struct MockMedia {
    pub(crate) fail: AtomicBool,
    pub(crate) gate: Option<Arc<Notify>>,
    pub(crate) acquired: AtomicUsize,
    pub(crate) stops: Arc<AtomicUsize>,
}

#[async_trait]
impl MediaDevices for MockMedia {
    async fn acquire_microphone(&self) -> anyhow::Result<Arc<dyn LocalMediaStream>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("permission denied");
        }
        self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockStream {
            stops: Arc::clone(&self.stops),
        }))
    }
}

pub(crate) struct MockPeer {
    fail_remote: bool,
    remote_gate: Option<Arc<Notify>>,
    closes: Arc<AtomicUsize>,
    pub(crate) remote: Mutex<Vec<SessionDescription>>,
    pub(crate) events: broadcast::Sender<PeerConnectionEvent>,
}

#[async_trait]
impl PeerConnectionSession for MockPeer {
    async fn add_local_stream(&self, _stream: Arc<dyn LocalMediaStream>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::offer("offer-sdp"))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        Ok(SessionDescription::answer("answer-sdp"))
    }

    async fn set_local_description(&self, _description: SessionDescription) -> anyhow::Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()> {
        if let Some(gate) = &self.remote_gate {
            gate.notified().await;
        }
        if self.fail_remote {
            bail!("malformed remote description");
        }
        self.remote.lock().expect("remote").push(description);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent> {
        self.events.subscribe()
    }
}

#[derive(Default)]
pub(crate) struct MockFactory {
    pub(crate) fail_remote: AtomicBool,
    pub(crate) remote_gate: Option<Arc<Notify>>,
    pub(crate) closes: Arc<AtomicUsize>,
    pub(crate) created: Mutex<Vec<Arc<MockPeer>>>,
}

impl MockFactory {
    pub(crate) fn peer_count(&self) -> usize {
        self.created.lock().expect("created").len()
    }

    pub(crate) fn last_peer(&self) -> Arc<MockPeer> {
        self.created
            .lock()
            .expect("created")
            .last()
            .cloned()
            .expect("peer created")
    }
}

#[async_trait]
impl PeerConnectionFactory for MockFactory {
    async fn create(&self) -> anyhow::Result<Arc<dyn PeerConnectionSession>> {
        let (events, _) = broadcast::channel(8);
        let peer = Arc::new(MockPeer {
            fail_remote: self.fail_remote.load(Ordering::SeqCst),
            remote_gate: self.remote_gate.clone(),
            closes: Arc::clone(&self.closes),
            remote: Mutex::new(Vec::new()),
            events,
        });
        self.created.lock().expect("created").push(Arc::clone(&peer));
        Ok(peer)
    }
}
