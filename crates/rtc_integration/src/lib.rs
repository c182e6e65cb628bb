use std::sync::Arc;

use async_trait::async_trait;
use shared::protocol::SessionDescription;
use tokio::sync::broadcast;

/// A captured local audio stream. Stopping the tracks releases the device.
pub trait LocalMediaStream: Send + Sync {
    fn stream_id(&self) -> &str;
    fn stop_tracks(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire_microphone(&self) -> anyhow::Result<Arc<dyn LocalMediaStream>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerConnectionEvent {
    RemoteTrackAdded { stream_id: String },
    ConnectionFailed { reason: String },
}

#[async_trait]
pub trait PeerConnectionSession: Send + Sync {
    async fn add_local_stream(&self, stream: Arc<dyn LocalMediaStream>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription)
        -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerConnectionEvent>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self) -> anyhow::Result<Arc<dyn PeerConnectionSession>>;
}
