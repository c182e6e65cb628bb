use std::sync::{Arc, Weak};

use rtc_integration::{
    LocalMediaStream, MediaDevices, PeerConnectionEvent, PeerConnectionFactory,
    PeerConnectionSession,
};
use shared::{
    domain::{CallDirection, CallPhase, LocalUser, UserId},
    protocol::{ClientRequest, SessionDescription},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{error::ClientError, transport::EventSink, ClientEvent};

/// UI-facing view of the current call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSnapshot {
    pub session_id: u64,
    pub peer_id: UserId,
    pub peer_display_name: Option<String>,
    pub direction: CallDirection,
    pub phase: CallPhase,
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingStep {
    Dialing,
    Accepting,
    ApplyingAnswer,
}

struct CallSession {
    id: u64,
    peer_id: UserId,
    peer_display_name: Option<String>,
    direction: CallDirection,
    phase: CallPhase,
    pending: Option<PendingStep>,
    remote_offer: Option<SessionDescription>,
    media: Option<Arc<dyn LocalMediaStream>>,
    negotiation: Option<Arc<dyn PeerConnectionSession>>,
    event_task: Option<JoinHandle<()>>,
}

impl CallSession {
    fn new(
        id: u64,
        peer_id: UserId,
        peer_display_name: Option<String>,
        direction: CallDirection,
        phase: CallPhase,
    ) -> Self {
        Self {
            id,
            peer_id,
            peer_display_name,
            direction,
            phase,
            pending: None,
            remote_offer: None,
            media: None,
            negotiation: None,
            event_task: None,
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            session_id: self.id,
            peer_id: self.peer_id.clone(),
            peer_display_name: self.peer_display_name.clone(),
            direction: self.direction,
            phase: self.phase,
            pending: self.pending.is_some(),
        }
    }

    /// An outgoing session stays in `Idle` until its offer has gone out.
    fn signaling_started(&self) -> bool {
        self.phase != CallPhase::Idle
    }
}

#[derive(Default)]
struct CallState {
    next_session_id: u64,
    session: Option<CallSession>,
}

impl CallState {
    fn take_matching(&mut self, session_id: u64) -> Option<CallSession> {
        if self.session.as_ref().is_some_and(|s| s.id == session_id) {
            self.session.take()
        } else {
            None
        }
    }

    fn matching_mut(&mut self, session_id: u64) -> Option<&mut CallSession> {
        self.session.as_mut().filter(|s| s.id == session_id)
    }
}

/// Owns the single call session of this client.
pub struct CallController {
    local_user: LocalUser,
    sink: Arc<dyn EventSink>,
    media: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    state: Mutex<CallState>,
    events: broadcast::Sender<ClientEvent>,
}

impl CallController {
    pub fn new(
        local_user: LocalUser,
        sink: Arc<dyn EventSink>,
        media: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_user,
            sink,
            media,
            peers,
            state: Mutex::new(CallState::default()),
            events,
        })
    }

    pub async fn snapshot(&self) -> Option<CallSnapshot> {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(CallSession::snapshot)
    }

    pub async fn phase(&self) -> CallPhase {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .map(|s| s.phase)
            .unwrap_or(CallPhase::Idle)
    }

    /// True when no session exists, including one still acquiring media.
    pub async fn is_idle(&self) -> bool {
        self.state.lock().await.session.is_none()
    }

    pub async fn start_call(
        self: &Arc<Self>,
        peer_id: UserId,
        peer_display_name: Option<String>,
    ) -> Result<(), ClientError> {
        let (session_id, reserved) = {
            let mut state = self.state.lock().await;
            if let Some(existing) = &state.session {
                warn!(
                    peer_id = %peer_id,
                    busy_with = %existing.peer_id,
                    "call: start rejected; a call is already in progress"
                );
                return Err(ClientError::CallInProgress);
            }
            state.next_session_id += 1;
            let mut session = CallSession::new(
                state.next_session_id,
                peer_id.clone(),
                peer_display_name,
                CallDirection::Outgoing,
                CallPhase::Idle,
            );
            session.pending = Some(PendingStep::Dialing);
            let reserved = session.snapshot();
            state.session = Some(session);
            (reserved.session_id, reserved)
        };
        info!(session_id, peer_id = %peer_id, "call: dialing");
        self.publish(reserved);

        let stream = match self.media.acquire_microphone().await {
            Ok(stream) => stream,
            Err(err) => {
                self.abort_session(session_id, "media unavailable").await;
                return Err(self.media_failure(err));
            }
        };
        if !self.is_current(session_id).await {
            stream.stop_tracks();
            return Err(ClientError::CallCancelled);
        }

        let negotiation = match self.peers.create().await {
            Ok(negotiation) => negotiation,
            Err(err) => {
                stream.stop_tracks();
                return Err(self.abort_after_failure(session_id, err).await);
            }
        };

        let offer = match create_local_offer(&negotiation, &stream).await {
            Ok(offer) => offer,
            Err(err) => {
                release_unclaimed(&stream, &negotiation).await;
                return Err(self.abort_after_failure(session_id, err).await);
            }
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(session) = state.matching_mut(session_id) else {
                drop(state);
                info!(session_id, "call: dial cancelled before the offer went out");
                release_unclaimed(&stream, &negotiation).await;
                return Err(ClientError::CallCancelled);
            };
            let sent = self.sink.emit(ClientRequest::CallUser {
                to: session.peer_id.clone(),
                from: self.local_user.id.clone(),
                name: self.local_user.name.clone(),
                signal: offer,
            });
            if !sent {
                let session = state.session.take();
                drop(state);
                warn!(session_id, "call: channel not connected; call_user not sent");
                release_unclaimed(&stream, &negotiation).await;
                if let Some(session) = session {
                    self.finish(session, "channel unavailable").await;
                }
                return Err(ClientError::Transport(
                    "channel is not connected".to_string(),
                ));
            }
            session.phase = CallPhase::RingingOut;
            session.pending = None;
            session.media = Some(stream);
            session.event_task = Some(self.spawn_negotiation_events(session_id, &negotiation));
            session.negotiation = Some(negotiation);
            session.snapshot()
        };
        info!(session_id, peer_id = %snapshot.peer_id, "call: ringing out");
        self.publish(snapshot);
        Ok(())
    }

    pub async fn handle_incoming_call(
        &self,
        from: UserId,
        signal: SessionDescription,
        name: Option<String>,
    ) -> Result<(), ClientError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            if let Some(existing) = &state.session {
                info!(
                    from = %from,
                    busy_with = %existing.peer_id,
                    "call: dropping incoming call while busy"
                );
                return Err(self.stale("incoming_call", existing.phase));
            }
            state.next_session_id += 1;
            let mut session = CallSession::new(
                state.next_session_id,
                from.clone(),
                name.clone(),
                CallDirection::Incoming,
                CallPhase::RingingIn,
            );
            session.remote_offer = Some(signal);
            let snapshot = session.snapshot();
            state.session = Some(session);
            snapshot
        };
        info!(session_id = snapshot.session_id, from = %from, "call: ringing in");
        let _ = self.events.send(ClientEvent::IncomingCall { from, name });
        self.publish(snapshot);
        Ok(())
    }

    pub async fn accept_call(self: &Arc<Self>) -> Result<(), ClientError> {
        let (session_id, offer) = {
            let mut state = self.state.lock().await;
            match state.session.as_mut() {
                Some(session)
                    if session.phase == CallPhase::RingingIn && session.pending.is_none() =>
                {
                    session.pending = Some(PendingStep::Accepting);
                    (session.id, session.remote_offer.clone())
                }
                Some(session) => {
                    return Err(ClientError::InvalidCallPhase {
                        action: "accept",
                        phase: session.phase,
                    })
                }
                None => {
                    return Err(ClientError::InvalidCallPhase {
                        action: "accept",
                        phase: CallPhase::Idle,
                    })
                }
            }
        };

        let stream = match self.media.acquire_microphone().await {
            Ok(stream) => stream,
            Err(err) => {
                self.abort_session(session_id, "media unavailable").await;
                return Err(self.media_failure(err));
            }
        };
        if !self.is_current(session_id).await {
            stream.stop_tracks();
            return Err(ClientError::CallCancelled);
        }

        let negotiation = match self.peers.create().await {
            Ok(negotiation) => negotiation,
            Err(err) => {
                stream.stop_tracks();
                return Err(self.abort_after_failure(session_id, err).await);
            }
        };

        let answer = match offer {
            Some(offer) => create_local_answer(&negotiation, &stream, offer).await,
            None => Err(anyhow::anyhow!("no remote offer stored for incoming call")),
        };
        let answer = match answer {
            Ok(answer) => answer,
            Err(err) => {
                release_unclaimed(&stream, &negotiation).await;
                return Err(self.abort_after_failure(session_id, err).await);
            }
        };

        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .matching_mut(session_id)
                .filter(|s| s.phase == CallPhase::RingingIn)
            else {
                drop(state);
                info!(session_id, "call: accept cancelled before the answer went out");
                release_unclaimed(&stream, &negotiation).await;
                return Err(ClientError::CallCancelled);
            };
            let sent = self.sink.emit(ClientRequest::AnswerCall {
                to: session.peer_id.clone(),
                from: self.local_user.id.clone(),
                signal: answer,
            });
            if !sent {
                let session = state.session.take();
                drop(state);
                warn!(session_id, "call: channel not connected; answer_call not sent");
                release_unclaimed(&stream, &negotiation).await;
                if let Some(session) = session {
                    self.finish(session, "channel unavailable").await;
                }
                return Err(ClientError::Transport(
                    "channel is not connected".to_string(),
                ));
            }
            session.phase = CallPhase::Active;
            session.pending = None;
            session.remote_offer = None;
            session.media = Some(stream);
            session.event_task = Some(self.spawn_negotiation_events(session_id, &negotiation));
            session.negotiation = Some(negotiation);
            session.snapshot()
        };
        info!(session_id, peer_id = %snapshot.peer_id, "call: active (accepted)");
        self.publish(snapshot);
        Ok(())
    }

    pub async fn reject_call(&self) -> Result<(), ClientError> {
        let session = {
            let mut state = self.state.lock().await;
            let phase = state
                .session
                .as_ref()
                .map(|s| s.phase)
                .unwrap_or(CallPhase::Idle);
            if phase != CallPhase::RingingIn {
                return Err(ClientError::InvalidCallPhase {
                    action: "reject",
                    phase,
                });
            }
            let Some(session) = state.session.take() else {
                return Ok(());
            };
            self.transmit(ClientRequest::RejectCall {
                to: session.peer_id.clone(),
                from: self.local_user.id.clone(),
            });
            session
        };
        self.finish(session, "local reject").await;
        Ok(())
    }

    pub async fn cancel_call(&self) -> Result<(), ClientError> {
        let session = {
            let mut state = self.state.lock().await;
            let (direction, phase) = state
                .session
                .as_ref()
                .map(|s| (s.direction, s.phase))
                .unwrap_or((CallDirection::Outgoing, CallPhase::Idle));
            let dialing = direction == CallDirection::Outgoing
                && matches!(phase, CallPhase::Idle | CallPhase::RingingOut);
            if !dialing || state.session.is_none() {
                return Err(ClientError::InvalidCallPhase {
                    action: "cancel",
                    phase,
                });
            }
            let Some(session) = state.session.take() else {
                return Ok(());
            };
            if session.signaling_started() {
                self.transmit(ClientRequest::EndCall {
                    to: session.peer_id.clone(),
                });
            }
            session
        };
        self.finish(session, "local cancel").await;
        Ok(())
    }

    /// Hangs up whatever call exists. A no-op when idle.
    pub async fn end_call(&self) {
        let session = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session.take() else {
                debug!("call: end requested while idle");
                return;
            };
            if session.signaling_started() {
                self.transmit(ClientRequest::EndCall {
                    to: session.peer_id.clone(),
                });
            }
            session
        };
        self.finish(session, "local end").await;
    }

    pub async fn handle_remote_answer(
        &self,
        signal: SessionDescription,
    ) -> Result<(), ClientError> {
        let (session_id, negotiation) = {
            let mut state = self.state.lock().await;
            let phase = state
                .session
                .as_ref()
                .map(|s| s.phase)
                .unwrap_or(CallPhase::Idle);
            match state.session.as_mut() {
                Some(session)
                    if session.phase == CallPhase::RingingOut && session.pending.is_none() =>
                {
                    let Some(negotiation) = session.negotiation.clone() else {
                        return Err(self.stale("call_answered", phase));
                    };
                    session.pending = Some(PendingStep::ApplyingAnswer);
                    (session.id, negotiation)
                }
                _ => return Err(self.stale("call_answered", phase)),
            }
        };

        if let Err(err) = negotiation.set_remote_description(signal).await {
            return Err(self.abort_after_failure(session_id, err).await);
        }

        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .matching_mut(session_id)
                .filter(|s| s.phase == CallPhase::RingingOut)
            else {
                return Err(self.stale("call_answered", CallPhase::Idle));
            };
            session.phase = CallPhase::Active;
            session.pending = None;
            session.snapshot()
        };
        info!(session_id, peer_id = %snapshot.peer_id, "call: active (answered)");
        self.publish(snapshot);
        Ok(())
    }

    pub async fn handle_remote_end(&self) {
        self.close_from_remote("call_ended").await;
    }

    pub async fn handle_remote_reject(&self) {
        self.close_from_remote("call_rejected").await;
    }

    async fn close_from_remote(&self, event: &'static str) {
        let session = {
            let mut state = self.state.lock().await;
            // A session still dialing has not signaled, so the event is not about it.
            if !state
                .session
                .as_ref()
                .is_some_and(CallSession::signaling_started)
            {
                debug!(event, "call: remote close with no signaled session");
                return;
            }
            state.session.take()
        };
        if let Some(session) = session {
            self.finish(session, event).await;
        }
    }

    fn spawn_negotiation_events(
        self: &Arc<Self>,
        session_id: u64,
        negotiation: &Arc<dyn PeerConnectionSession>,
    ) -> JoinHandle<()> {
        let mut events = negotiation.subscribe_events();
        let controller: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_id, skipped, "call: negotiation events lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(controller) = controller.upgrade() else {
                    break;
                };
                match event {
                    PeerConnectionEvent::RemoteTrackAdded { stream_id } => {
                        info!(session_id, stream_id = %stream_id, "call: remote audio attached");
                        let _ = controller
                            .events
                            .send(ClientEvent::RemoteAudioAttached { stream_id });
                    }
                    PeerConnectionEvent::ConnectionFailed { reason } => {
                        warn!(session_id, reason = %reason, "call: peer connection failed");
                        controller.terminate_from_negotiation(session_id, reason).await;
                        break;
                    }
                }
            }
        })
    }

    async fn terminate_from_negotiation(&self, session_id: u64, reason: String) {
        let session = {
            let mut state = self.state.lock().await;
            let Some(mut session) = state.take_matching(session_id) else {
                return;
            };
            // Called from the event task itself; detach instead of aborting it.
            session.event_task = None;
            if let Some(request) = self.farewell(&session) {
                self.transmit(request);
            }
            session
        };
        self.finish(session, "connection failed").await;
        let _ = self.events.send(ClientEvent::Error(
            ClientError::Negotiation(reason).to_string(),
        ));
    }

    /// Tears down the session after an async step failed and tells the peer.
    async fn abort_after_failure(&self, session_id: u64, err: anyhow::Error) -> ClientError {
        let error = ClientError::Negotiation(format!("{err:#}"));
        warn!(session_id, "call: {error}");
        self.abort_session(session_id, "negotiation failed").await;
        let _ = self.events.send(ClientEvent::Error(error.to_string()));
        error
    }

    async fn abort_session(&self, session_id: u64, reason: &'static str) {
        let session = {
            let mut state = self.state.lock().await;
            let Some(session) = state.take_matching(session_id) else {
                return;
            };
            if let Some(request) = self.farewell(&session) {
                self.transmit(request);
            }
            session
        };
        self.finish(session, reason).await;
    }

    async fn is_current(&self, session_id: u64) -> bool {
        self.state
            .lock()
            .await
            .session
            .as_ref()
            .is_some_and(|s| s.id == session_id)
    }

    fn farewell(&self, session: &CallSession) -> Option<ClientRequest> {
        match session.phase {
            CallPhase::Idle | CallPhase::Ended => None,
            CallPhase::RingingIn => Some(ClientRequest::RejectCall {
                to: session.peer_id.clone(),
                from: self.local_user.id.clone(),
            }),
            CallPhase::RingingOut | CallPhase::Active => Some(ClientRequest::EndCall {
                to: session.peer_id.clone(),
            }),
        }
    }

    /// Releases everything a removed session owns and publishes the way out.
    async fn finish(&self, mut session: CallSession, reason: &'static str) {
        if let Some(task) = session.event_task.take() {
            task.abort();
        }
        if let Some(stream) = session.media.take() {
            stream.stop_tracks();
        }
        if let Some(negotiation) = session.negotiation.take() {
            if let Err(err) = negotiation.close().await {
                warn!(session_id = session.id, "call: failed to close negotiation: {err:#}");
            }
        }

        if session.phase == CallPhase::Active {
            session.phase = CallPhase::Ended;
            session.pending = None;
            self.publish(session.snapshot());
        }
        session.phase = CallPhase::Idle;
        session.pending = None;
        info!(
            session_id = session.id,
            peer_id = %session.peer_id,
            reason,
            "call: session closed"
        );
        self.publish(session.snapshot());
    }

    fn media_failure(&self, err: anyhow::Error) -> ClientError {
        let error = ClientError::MediaUnavailable(format!("{err:#}"));
        warn!("call: {error}");
        let _ = self.events.send(ClientEvent::Error(error.to_string()));
        error
    }

    fn transmit(&self, request: ClientRequest) {
        let name = request.name();
        if !self.sink.emit(request) {
            debug!(event = name, "call: channel not connected; signaling event dropped");
        }
    }

    fn stale(&self, event: &'static str, phase: CallPhase) -> ClientError {
        debug!(event, ?phase, "call: ignoring stale signaling event");
        ClientError::StaleEvent { event, phase }
    }

    fn publish(&self, snapshot: CallSnapshot) {
        let _ = self.events.send(ClientEvent::CallStateChanged(snapshot));
    }
}

async fn create_local_offer(
    negotiation: &Arc<dyn PeerConnectionSession>,
    stream: &Arc<dyn LocalMediaStream>,
) -> anyhow::Result<SessionDescription> {
    negotiation.add_local_stream(Arc::clone(stream)).await?;
    let offer = negotiation.create_offer().await?;
    negotiation.set_local_description(offer.clone()).await?;
    Ok(offer)
}

async fn create_local_answer(
    negotiation: &Arc<dyn PeerConnectionSession>,
    stream: &Arc<dyn LocalMediaStream>,
    offer: SessionDescription,
) -> anyhow::Result<SessionDescription> {
    negotiation.add_local_stream(Arc::clone(stream)).await?;
    negotiation.set_remote_description(offer).await?;
    let answer = negotiation.create_answer().await?;
    negotiation.set_local_description(answer.clone()).await?;
    Ok(answer)
}

async fn release_unclaimed(
    stream: &Arc<dyn LocalMediaStream>,
    negotiation: &Arc<dyn PeerConnectionSession>,
) {
    stream.stop_tracks();
    if let Err(err) = negotiation.close().await {
        warn!("call: failed to close unclaimed negotiation: {err:#}");
    }
}

#[cfg(test)]
#[path = "tests/call_tests.rs"]
mod tests;
