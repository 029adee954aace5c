use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use iris_protocol::{ParsedCandidate, SignalingMessage};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::ice;
use crate::peer;
use crate::registry::PeerRegistry;
use crate::signaling::SignalingTransport;
use crate::video::{self, VideoSourceFactory};

/// Maximum time to wait for ICE gathering before answering with whatever
/// SDP is present. Covers clients that cannot consume trickled candidates.
const ICE_GATHERING_TIMEOUT: Duration = Duration::from_secs(5);

/// One signaling connection bound to one peer connection.
///
/// The receive loop, the message handlers, and cleanup all run on the
/// session's own task. Peer-connection callbacks fire on library tasks and
/// only feed the candidate queue and the gathering latch; they never touch
/// the transport.
pub struct Session<T: SignalingTransport> {
    transport: T,
    registry: Arc<PeerRegistry>,
    track_factory: VideoSourceFactory,
    session_id: Uuid,
    pc: Option<Arc<RTCPeerConnection>>,
    closed: bool,
    cleanup_done: bool,
    gathering_tx: watch::Sender<bool>,
    gathering_rx: watch::Receiver<bool>,
    outbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    outbound_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    video_pump: Option<JoinHandle<()>>,
}

enum Event {
    Inbound(Result<Option<String>>),
    Outbound(SignalingMessage),
}

impl<T: SignalingTransport> Session<T> {
    pub fn new(
        transport: T,
        registry: Arc<PeerRegistry>,
        track_factory: VideoSourceFactory,
    ) -> Self {
        let (gathering_tx, gathering_rx) = watch::channel(false);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            transport,
            registry,
            track_factory,
            session_id: Uuid::new_v4(),
            pc: None,
            closed: false,
            cleanup_done: false,
            gathering_tx,
            gathering_rx,
            outbound_tx,
            outbound_rx,
            video_pump: None,
        }
    }

    /// Run the session to completion. On return the peer connection is
    /// closed and deregistered and the signaling channel is closed, no
    /// matter how the session ended.
    pub async fn run(mut self) {
        if let Err(e) = self.transport.accept().await {
            warn!(session_id = %self.session_id, "Failed to accept signaling channel: {e:#}");
            self.cleanup().await;
            return;
        }
        info!(session_id = %self.session_id, "Signaling channel accepted for WebRTC session");

        if let Err(e) = self.setup_peer().await {
            error!(session_id = %self.session_id, "Failed to set up peer connection: {e:#}");
            self.cleanup().await;
            return;
        }

        while !self.closed {
            let event = tokio::select! {
                frame = self.transport.recv_text() => Event::Inbound(frame),
                Some(msg) = self.outbound_rx.recv() => Event::Outbound(msg),
            };
            match event {
                Event::Inbound(Ok(Some(text))) => self.handle_frame(&text).await,
                Event::Inbound(Ok(None)) => {
                    info!(session_id = %self.session_id, "Signaling channel closed by client");
                    break;
                }
                Event::Inbound(Err(e)) => {
                    warn!(session_id = %self.session_id, "Signaling channel receive error: {e:#}");
                    break;
                }
                Event::Outbound(msg) => self.send(&msg).await,
            }
        }

        self.cleanup().await;
    }

    /// Create the peer connection, wire its event handlers, attach the
    /// outbound video track, and register with the process-wide registry.
    async fn setup_peer(&mut self) -> Result<()> {
        let pc = peer::new_peer_connection(ice::cached_ice_servers().to_vec()).await?;
        self.attach_pc_event_handlers(&pc);

        let source = (self.track_factory)();
        match video::attach_video_track(&pc, source).await {
            Ok(pump) => self.video_pump = Some(pump),
            Err(e) => {
                // The connection never reached the registry and cleanup will
                // not see it; close it here or its agent tasks live forever.
                if let Err(close_err) = pc.close().await {
                    warn!(
                        session_id = %self.session_id,
                        "Error closing peer connection after track setup failure: {close_err}"
                    );
                }
                return Err(e).context("Failed to attach video track");
            }
        }

        self.registry.register(Arc::clone(&pc)).await;
        self.pc = Some(pc);
        Ok(())
    }

    fn attach_pc_event_handlers(&self, pc: &Arc<RTCPeerConnection>) {
        let session_id = self.session_id;
        pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
            match state {
                RTCIceConnectionState::Failed => {
                    error!(%session_id, "ICE connection failed, check STUN/TURN servers and network");
                }
                RTCIceConnectionState::Disconnected => {
                    warn!(%session_id, "ICE connection disconnected");
                }
                RTCIceConnectionState::Connected => {
                    info!(%session_id, "ICE connection established");
                }
                _ => info!(%session_id, ?state, "ICE connection state changed"),
            }
            Box::pin(async {})
        }));

        let session_id = self.session_id;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            match state {
                RTCPeerConnectionState::Failed => error!(%session_id, "Peer connection failed"),
                RTCPeerConnectionState::Connected => {
                    info!(%session_id, "Peer connection established");
                }
                _ => info!(%session_id, ?state, "Peer connection state changed"),
            }
            Box::pin(async {})
        }));

        let session_id = self.session_id;
        let gathering_tx = self.gathering_tx.clone();
        pc.on_ice_gathering_state_change(Box::new(move |state: RTCIceGathererState| {
            info!(%session_id, ?state, "ICE gathering state changed");
            if state == RTCIceGathererState::Complete {
                gathering_tx.send_replace(true);
            }
            Box::pin(async {})
        }));

        // Trickle ICE fan-out. The final null-candidate event is covered by
        // the gathering-complete transition; no explicit end-of-candidates
        // frame is sent to the client.
        let session_id = self.session_id;
        let outbound = self.outbound_tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            if let Some(c) = candidate {
                match c.to_json() {
                    Ok(json) => {
                        debug!(%session_id, candidate = %json.candidate, "Forwarding local ICE candidate");
                        let _ = outbound.send(SignalingMessage::IceCandidate {
                            candidate: Some(json.candidate),
                            sdp_mid: json.sdp_mid,
                            sdp_m_line_index: json.sdp_mline_index,
                        });
                    }
                    Err(e) => warn!(%session_id, "Failed to serialize ICE candidate: {e}"),
                }
            }
            Box::pin(async {})
        }));
    }

    /// Dispatch one inbound text frame. Malformed or unknown frames are
    /// logged and dropped; nothing here takes the session down except a
    /// peer-connection failure while answering.
    async fn handle_frame(&mut self, raw: &str) {
        let value: serde_json::Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(_) => {
                warn!(session_id = %self.session_id, "Received non-JSON signaling frame");
                return;
            }
        };
        let msg: SignalingMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(session_id = %self.session_id, "Unsupported signaling frame: {e}");
                return;
            }
        };

        match msg {
            SignalingMessage::Offer { sdp } => {
                if let Err(e) = self.handle_offer(sdp).await {
                    error!(session_id = %self.session_id, "Failed to handle offer: {e:#}");
                    self.closed = true;
                }
            }
            SignalingMessage::IceCandidate {
                candidate,
                sdp_mid,
                sdp_m_line_index,
            } => {
                self.handle_ice_candidate(candidate, sdp_mid, sdp_m_line_index)
                    .await;
            }
            SignalingMessage::Bye => {
                info!(session_id = %self.session_id, "Received 'bye' from client, closing session");
                self.closed = true;
            }
            SignalingMessage::Ping => self.send(&SignalingMessage::Pong).await,
            SignalingMessage::Pong => {
                warn!(session_id = %self.session_id, "Ignoring unexpected 'pong' from client");
            }
            SignalingMessage::Answer { .. } => {
                warn!(
                    session_id = %self.session_id,
                    "Ignoring 'answer' from client, this server is the answerer"
                );
            }
        }
    }

    /// Apply the client's offer and reply with exactly one answer carrying
    /// the local description as it stands after gathering (or the timeout).
    async fn handle_offer(&mut self, sdp: String) -> Result<()> {
        let Some(pc) = self.pc.clone() else {
            error!(session_id = %self.session_id, "No peer connection in session when handling offer");
            return Ok(());
        };

        let offer = RTCSessionDescription::offer(sdp).context("Failed to parse SDP offer")?;
        pc.set_remote_description(offer)
            .await
            .context("Failed to set remote description")?;

        let answer = pc
            .create_answer(None)
            .await
            .context("Failed to create answer")?;
        pc.set_local_description(answer)
            .await
            .context("Failed to set local description")?;

        self.wait_for_ice_gathering().await;

        let Some(local) = pc.local_description().await else {
            warn!(session_id = %self.session_id, "No local description after answering, nothing to send");
            return Ok(());
        };
        self.send(&SignalingMessage::Answer { sdp: local.sdp }).await;
        info!(session_id = %self.session_id, "WebRTC answer sent to client");
        Ok(())
    }

    /// Block until the gathering latch is set, bounded by
    /// ICE_GATHERING_TIMEOUT. On timeout the session proceeds with the SDP
    /// it has, so non-trickle clients still get a usable answer.
    async fn wait_for_ice_gathering(&mut self) {
        if *self.gathering_rx.borrow() {
            return;
        }
        let mut rx = self.gathering_rx.clone();
        match tokio::time::timeout(ICE_GATHERING_TIMEOUT, rx.wait_for(|complete| *complete)).await
        {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => debug!(session_id = %self.session_id, "Gathering latch dropped"),
            Err(_) => warn!(
                session_id = %self.session_id,
                "ICE gathering timeout after {}s, answering with partial SDP",
                ICE_GATHERING_TIMEOUT.as_secs()
            ),
        }
    }

    async fn handle_ice_candidate(
        &mut self,
        candidate: Option<String>,
        sdp_mid: Option<String>,
        sdp_m_line_index: Option<u16>,
    ) {
        let Some(pc) = self.pc.clone() else {
            error!(session_id = %self.session_id, "No peer connection in session when handling ICE candidate");
            return;
        };

        let ice_state = pc.ice_connection_state();
        if matches!(
            ice_state,
            RTCIceConnectionState::Closed
                | RTCIceConnectionState::Failed
                | RTCIceConnectionState::Disconnected
        ) {
            warn!(
                session_id = %self.session_id,
                ?ice_state,
                "Ignoring ICE candidate, peer connection is unusable"
            );
            return;
        }

        let Some(line) = candidate else {
            debug!(session_id = %self.session_id, "Received end-of-candidates signal");
            if let Err(e) = pc.add_ice_candidate(RTCIceCandidateInit::default()).await {
                error!(session_id = %self.session_id, "Failed to process end-of-candidates: {e}");
            }
            return;
        };

        let parsed = match ParsedCandidate::parse(&line) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    candidate = %line,
                    "Invalid ICE candidate from client: {e}"
                );
                return;
            }
        };

        let init = RTCIceCandidateInit {
            candidate: line,
            sdp_mid,
            sdp_mline_index: sdp_m_line_index,
            ..Default::default()
        };
        match pc.add_ice_candidate(init).await {
            Ok(()) => info!(
                session_id = %self.session_id,
                typ = %parsed.typ,
                address = %parsed.address,
                protocol = %parsed.protocol,
                port = parsed.port,
                "Added ICE candidate from client"
            ),
            Err(e) => error!(session_id = %self.session_id, "Failed to add ICE candidate: {e}"),
        }
    }

    /// Serialize and send one message. A transport failure marks the
    /// session closed so the loop exits at the next boundary.
    async fn send(&mut self, msg: &SignalingMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                error!(session_id = %self.session_id, "Failed to serialize signaling message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send_text(&json).await {
            warn!(session_id = %self.session_id, "Failed to send over signaling channel: {e:#}");
            self.closed = true;
        }
    }

    /// Release everything the session owns. Runs exactly once no matter
    /// how many exit paths reach it.
    async fn cleanup(&mut self) {
        if self.cleanup_done {
            return;
        }
        self.cleanup_done = true;
        info!(session_id = %self.session_id, "Cleaning up WebRTC session");

        if let Some(pump) = self.video_pump.take() {
            pump.abort();
        }

        if let Some(pc) = self.pc.take() {
            let state = pc.connection_state();
            if !matches!(
                state,
                RTCPeerConnectionState::Closed | RTCPeerConnectionState::Failed
            ) && let Err(e) = pc.close().await
            {
                warn!(session_id = %self.session_id, "Error closing peer connection: {e}");
            }
            self.registry.unregister(&pc).await;
        }

        self.transport.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    use crate::video::TestPatternSource;

    /// In-memory transport: the test scripts inbound frames and collects
    /// everything the session sends.
    struct ChannelTransport {
        incoming: UnboundedReceiver<String>,
        outgoing: UnboundedSender<String>,
        close_count: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl SignalingTransport for ChannelTransport {
        async fn recv_text(&mut self) -> Result<Option<String>> {
            Ok(self.incoming.recv().await)
        }

        async fn send_text(&mut self, text: &str) -> Result<()> {
            self.outgoing
                .send(text.to_string())
                .map_err(|_| anyhow::anyhow!("test receiver dropped"))
        }

        async fn close(&mut self) {
            self.close_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        registry: Arc<PeerRegistry>,
        to_session: UnboundedSender<String>,
        from_session: UnboundedReceiver<String>,
        close_count: Arc<AtomicUsize>,
        session: Option<Session<ChannelTransport>>,
    }

    fn harness() -> Harness {
        let (to_session, incoming) = unbounded_channel();
        let (outgoing, from_session) = unbounded_channel();
        let close_count = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(PeerRegistry::new());

        let transport = ChannelTransport {
            incoming,
            outgoing,
            close_count: Arc::clone(&close_count),
        };
        let factory: VideoSourceFactory =
            Box::new(|| Box::new(TestPatternSource::new(64, 48, 30)));
        let session = Session::new(transport, Arc::clone(&registry), factory);

        Harness {
            registry,
            to_session,
            from_session,
            close_count,
            session: Some(session),
        }
    }

    impl Harness {
        /// Run the session over the given frames, dropping the input
        /// afterwards, and return every frame the session sent.
        async fn run_script(&mut self, frames: &[&str]) -> Vec<SignalingMessage> {
            for frame in frames {
                self.to_session.send((*frame).to_string()).unwrap();
            }
            // Drop our sender so the session sees EOF once the script is
            // exhausted (unless a bye ended it earlier).
            let to_session = std::mem::replace(&mut self.to_session, unbounded_channel().0);
            drop(to_session);

            let session = self.session.take().expect("session already consumed");
            session.run().await;

            let mut sent = Vec::new();
            while let Ok(frame) = self.from_session.try_recv() {
                sent.push(serde_json::from_str(&frame).expect("server sent invalid JSON"));
            }
            sent
        }
    }

    /// A real SDP offer from a webrtc-rs client wanting to receive video.
    async fn client_video_offer() -> String {
        let pc = peer::new_peer_connection(Vec::new()).await.unwrap();
        pc.add_transceiver_from_kind(RTPCodecType::Video, None)
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        pc.close().await.unwrap();
        offer.sdp
    }

    #[tokio::test]
    async fn ping_gets_exactly_one_pong() {
        let mut h = harness();
        let sent = h.run_script(&[r#"{"type":"ping"}"#]).await;
        assert_eq!(sent, vec![SignalingMessage::Pong]);
        assert_eq!(h.registry.len().await, 0);
        assert_eq!(h.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ping_then_bye_cleans_up_once() {
        let mut h = harness();
        let sent = h
            .run_script(&[r#"{"type":"ping"}"#, r#"{"type":"bye"}"#])
            .await;
        assert_eq!(sent, vec![SignalingMessage::Pong]);
        assert_eq!(h.close_count.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.len().await, 0);
    }

    #[tokio::test]
    async fn offer_yields_exactly_one_answer() {
        let offer = client_video_offer().await;
        let offer_frame =
            serde_json::to_string(&SignalingMessage::Offer { sdp: offer }).unwrap();

        let mut h = harness();
        let sent = h.run_script(&[&offer_frame, r#"{"type":"bye"}"#]).await;

        let answers: Vec<_> = sent
            .iter()
            .filter_map(|msg| match msg {
                SignalingMessage::Answer { sdp } => Some(sdp),
                _ => None,
            })
            .collect();
        assert_eq!(answers.len(), 1, "expected one answer, got {sent:?}");
        assert!(!answers[0].is_empty());

        // Everything else on the wire can only be trickled candidates.
        for msg in &sent {
            assert!(matches!(
                msg,
                SignalingMessage::Answer { .. } | SignalingMessage::IceCandidate { .. }
            ));
        }
        assert_eq!(h.registry.len().await, 0);
        assert_eq!(h.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn end_of_candidates_writes_nothing_back() {
        let mut h = harness();
        let sent = h
            .run_script(&[r#"{"type":"ice-candidate","candidate":null}"#])
            .await;
        assert!(sent.is_empty(), "unexpected frames: {sent:?}");
        assert_eq!(h.close_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bad_candidate_is_dropped_and_session_stays_open() {
        let mut h = harness();
        let sent = h
            .run_script(&[
                r#"{"type":"ice-candidate","candidate":"not a candidate","sdp_mid":"0","sdp_m_line_index":0}"#,
                r#"{"type":"ping"}"#,
            ])
            .await;
        // The ping still being answered proves the bad candidate neither
        // produced output nor killed the session.
        assert_eq!(sent, vec![SignalingMessage::Pong]);
    }

    #[tokio::test]
    async fn malformed_and_unknown_frames_are_ignored() {
        let mut h = harness();
        let sent = h
            .run_script(&[
                "definitely not json",
                r#"{"no_type_here":true}"#,
                r#"{"type":"subscribe"}"#,
                r#"{"type":"offer"}"#,
                r#"{"type":"ping"}"#,
            ])
            .await;
        assert_eq!(sent, vec![SignalingMessage::Pong]);
    }

    #[tokio::test]
    async fn client_answer_and_pong_are_ignored() {
        let mut h = harness();
        let sent = h
            .run_script(&[
                r#"{"type":"answer","sdp":"v=0"}"#,
                r#"{"type":"pong"}"#,
                r#"{"type":"ping"}"#,
            ])
            .await;
        assert_eq!(sent, vec![SignalingMessage::Pong]);
    }

    #[tokio::test]
    async fn transport_eof_triggers_cleanup() {
        let mut h = harness();
        let sent = h.run_script(&[]).await;
        assert!(sent.is_empty());
        assert_eq!(h.close_count.load(Ordering::SeqCst), 1);
        assert_eq!(h.registry.len().await, 0);
    }

    #[tokio::test]
    async fn concurrent_sessions_share_the_registry() {
        let registry = Arc::new(PeerRegistry::new());
        let mut handles = Vec::new();
        let mut senders = Vec::new();

        for _ in 0..2 {
            let (to_session, incoming) = unbounded_channel();
            let (outgoing, _from_session) = unbounded_channel();
            let transport = ChannelTransport {
                incoming,
                outgoing,
                close_count: Arc::new(AtomicUsize::new(0)),
            };
            let factory: VideoSourceFactory =
                Box::new(|| Box::new(TestPatternSource::new(64, 48, 30)));
            let session = Session::new(transport, Arc::clone(&registry), factory);
            handles.push(tokio::spawn(session.run()));
            senders.push(to_session);
        }

        wait_for_registry_len(&registry, 2).await;

        for sender in &senders {
            sender.send(r#"{"type":"bye"}"#.to_string()).unwrap();
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(registry.len().await, 0);
    }

    async fn wait_for_registry_len(registry: &PeerRegistry, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if registry.len().await == expected {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| {
            panic!("registry never reached {expected} live peer connections")
        });
    }
}
