//! **Live Relay Session**: one real-time voice connection to the model.
//!
//! Lifecycle follows [`ConnectionState`]: a ticket is fetched from the trusted backend (INIT),
//! the transport is opened with the ticket in a subprotocol and the `setup` envelope goes out
//! first (CONNECTING), then three tasks run until close (OPEN):
//!
//! - **reader**: one ordered loop over inbound frames. Binary frames are PCM16 audio for the
//!   playback queue; text frames are control envelopes. `interrupted` flushes playback at once.
//! - **writer**: the only task that touches the transport sink. Setup, microphone audio and
//!   tool responses all funnel through one channel, so outbound frames are never interleaved.
//! - **mic forwarder**: capture chunks → PCM16 → writer, in capture order.
//!
//! Tool calls are never executed here. Each one is relayed to the backend on its own task;
//! calls with distinct ids may overlap, a repeated id is ignored while its first relay is in
//! flight.
//!
//! `close()` is synchronous, idempotent and safe from any task or state. It stops the
//! microphone and tells the tasks to exit without waiting for the remote end.

use crate::audio::{AudioSource, PlaybackSink};
use crate::codec::{decode_inline_pcm16, f32_to_pcm16, pcm16_to_f32};
use crate::error::{LiveError, LiveResult};
use crate::protocol::{
    setup_envelope, subprotocols, tool_response_envelope, FunctionCall, ServerContent,
    ServerEnvelope,
};
use crate::relay::{relay_error_text, ToolRelay, ToolRelayRequest};
use crate::state::{ConnectionState, StateCell};
use crate::transport::{Connector, Frame, FrameSink, FrameSource};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tale_core::{GenerativeProvider, LiveGrant, LiveOptions};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// How long the writer may spend on the closing handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LiveConfig {
    pub connect_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Collaborators of one session.
pub struct LiveDeps {
    pub connector: Arc<dyn Connector>,
    pub relay: Arc<dyn ToolRelay>,
    pub playback: Arc<dyn PlaybackSink>,
    pub mic: Box<dyn AudioSource>,
}

/// What the UI hears about.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    Opened { session_id: String, trace_id: String },
    SetupComplete,
    SpeakingChanged(bool),
    /// Barge-in: playback was flushed.
    Interrupted,
    TurnComplete,
    /// Domain signal for UI dimming; the session stays open.
    SleepDetected(Value),
    ToolRelayed { id: String, name: String, ok: bool },
    /// Terminal. `error` is the user-facing message when the session died of an error.
    Closed { error: Option<String> },
}

struct Shared {
    session_id: String,
    trace_id: String,
    state: StateCell,
    playback: Arc<dyn PlaybackSink>,
    relay: Arc<dyn ToolRelay>,
    mic: Mutex<Option<Box<dyn AudioSource>>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    events: mpsc::UnboundedSender<LiveEvent>,
    stop: watch::Sender<bool>,
    speaking: AtomicBool,
    in_flight: Mutex<HashSet<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Shared {
    fn emit(&self, event: LiveEvent) {
        // receiver gone just means nobody is listening
        let _ = self.events.send(event);
    }

    /// Queue a frame for the writer. Fails once the session is no longer open.
    fn send(&self, frame: Frame) -> LiveResult<()> {
        self.state.require_open()?;
        match lock(&self.outbound).as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| LiveError::Transport("writer stopped".to_string())),
            None => Err(LiveError::Transport("session closed".to_string())),
        }
    }

    /// Move to CLOSED and release local resources. Returns false if already closed.
    fn shutdown(&self, error: Option<&LiveError>) -> bool {
        let Some(from) = self.state.close() else {
            return false;
        };
        if let Some(mut mic) = lock(&self.mic).take() {
            mic.stop();
        }
        self.playback.flush();
        lock(&self.outbound).take();
        lock(&self.in_flight).clear();
        self.stop.send_replace(true);

        match error {
            Some(e) => warn!(
                target: "tale::live",
                session_id = %self.session_id,
                trace_id = %self.trace_id,
                from = %from,
                "session closed on error: {}", e
            ),
            None => info!(
                target: "tale::live",
                session_id = %self.session_id,
                trace_id = %self.trace_id,
                from = %from,
                "session closed"
            ),
        }
        self.emit(LiveEvent::Closed {
            error: error.map(LiveError::user_message),
        });
        true
    }

    fn set_speaking(&self, speaking: bool) {
        if self.speaking.swap(speaking, Ordering::SeqCst) != speaking {
            self.emit(LiveEvent::SpeakingChanged(speaking));
        }
    }

    fn play(&self, samples: LiveResult<Vec<f32>>) {
        match samples {
            Ok(samples) if samples.is_empty() => {}
            Ok(samples) => {
                self.set_speaking(true);
                self.playback.enqueue(samples);
            }
            Err(e) => warn!(target: "tale::live", session_id = %self.session_id, "dropping audio frame: {}", e),
        }
    }

    fn on_envelope(self: &Arc<Self>, text: &str) {
        let envelope = match ServerEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(target: "tale::live", session_id = %self.session_id, "ignoring envelope: {}", e);
                return;
            }
        };
        if envelope.setup_complete.is_some() {
            debug!(target: "tale::live", session_id = %self.session_id, "setup complete");
            self.emit(LiveEvent::SetupComplete);
        }
        if let Some(content) = envelope.server_content {
            self.on_server_content(&content);
        }
        if let Some(tool_call) = envelope.tool_call {
            for call in tool_call.function_calls {
                self.relay_tool_call(call);
            }
        }
    }

    fn on_server_content(&self, content: &ServerContent) {
        if content.interrupted {
            // audio already queued belongs to the response the user talked over
            self.playback.flush();
            self.set_speaking(false);
            info!(target: "tale::live", session_id = %self.session_id, "barge-in: playback flushed");
            self.emit(LiveEvent::Interrupted);
        } else {
            for data in content.inline_audio() {
                self.play(decode_inline_pcm16(data));
            }
        }
        if content.turn_complete {
            self.set_speaking(false);
            self.emit(LiveEvent::TurnComplete);
        }
        if let Some(signal) = content.sleep_signal() {
            info!(target: "tale::live", session_id = %self.session_id, "sleep detected");
            self.emit(LiveEvent::SleepDetected(signal.clone()));
        }
    }

    fn relay_tool_call(self: &Arc<Self>, call: FunctionCall) {
        if let Err(e) = self.state.require_open() {
            warn!(target: "tale::live", tool_call_id = %call.id, "tool call dropped: {}", e);
            return;
        }
        if !lock(&self.in_flight).insert(call.id.clone()) {
            warn!(target: "tale::live", tool_call_id = %call.id, "duplicate tool call id ignored");
            return;
        }

        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let request = ToolRelayRequest {
                tool_name: call.name.clone(),
                arguments: call.args.clone(),
                session_id: shared.session_id.clone(),
                trace_id: shared.trace_id.clone(),
                tool_call_id: call.id.clone(),
            };
            let outcome = shared
                .relay
                .relay(&request)
                .await
                .map_err(|e| relay_error_text(&e));
            let ok = outcome.is_ok();
            if let Err(e) = &outcome {
                warn!(
                    target: "tale::live",
                    session_id = %shared.session_id,
                    tool_call_id = %call.id,
                    tool = %call.name,
                    "tool relay failed: {}", e
                );
            }
            lock(&shared.in_flight).remove(&call.id);

            let sent = tool_response_envelope(&call, outcome)
                .and_then(|text| shared.send(Frame::Text(text)));
            match sent {
                Ok(()) => shared.emit(LiveEvent::ToolRelayed {
                    id: call.id,
                    name: call.name,
                    ok,
                }),
                Err(e) => debug!(
                    target: "tale::live",
                    tool_call_id = %call.id,
                    "tool response not sent: {}", e
                ),
            }
        });
    }
}

pub struct LiveSession {
    shared: Arc<Shared>,
    options: LiveOptions,
    connector: Arc<dyn Connector>,
    config: LiveConfig,
}

impl LiveSession {
    /// Build a session in INIT. Empty session/trace ids are filled with fresh UUIDs.
    pub fn new(
        mut options: LiveOptions,
        deps: LiveDeps,
        config: LiveConfig,
    ) -> (Self, mpsc::UnboundedReceiver<LiveEvent>) {
        if options.session_id.trim().is_empty() {
            options.session_id = uuid::Uuid::new_v4().to_string();
        }
        if options.trace_id.trim().is_empty() {
            options.trace_id = uuid::Uuid::new_v4().to_string();
        }
        let (events, events_rx) = mpsc::unbounded_channel();
        let (stop, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            session_id: options.session_id.clone(),
            trace_id: options.trace_id.clone(),
            state: StateCell::default(),
            playback: deps.playback,
            relay: deps.relay,
            mic: Mutex::new(Some(deps.mic)),
            outbound: Mutex::new(None),
            events,
            stop,
            speaking: AtomicBool::new(false),
            in_flight: Mutex::new(HashSet::new()),
        });
        let session = Self {
            shared,
            options,
            connector: deps.connector,
            config,
        };
        (session, events_rx)
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn trace_id(&self) -> &str {
        &self.shared.trace_id
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    pub fn is_speaking(&self) -> bool {
        self.shared.speaking.load(Ordering::SeqCst)
    }

    /// Ask the trusted backend for a ticket, then connect.
    pub async fn start(&self, provider: &dyn GenerativeProvider) -> LiveResult<()> {
        if self.state() != ConnectionState::Init {
            return Err(LiveError::IllegalTransition {
                from: self.state(),
                to: ConnectionState::Connecting,
            });
        }
        match provider.start_live_session(&self.options).await {
            Ok(grant) => self.connect(grant).await,
            Err(e) => {
                let err = LiveError::from(e);
                self.shared.shutdown(Some(&err));
                Err(err)
            }
        }
    }

    /// Open the transport with an already-issued grant.
    pub async fn connect(&self, grant: LiveGrant) -> LiveResult<()> {
        self.shared.state.transition(ConnectionState::Connecting)?;
        match self.open(grant).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.shutdown(Some(&e));
                Err(e)
            }
        }
    }

    async fn open(&self, grant: LiveGrant) -> LiveResult<()> {
        let shared = &self.shared;
        let protocols = subprotocols(&grant.ticket)?;
        let setup = setup_envelope(&grant.setup, &shared.session_id, &shared.trace_id)?;

        // the ticket is deliberately absent from every log line
        info!(
            target: "tale::live",
            session_id = %shared.session_id,
            trace_id = %shared.trace_id,
            url = %grant.url,
            "connecting"
        );
        let (sink, source) = tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&grant.url, &protocols),
        )
        .await
        .map_err(|_| LiveError::Transport("connect timed out".to_string()))??;

        // close() may have won the race while we were connecting
        shared.state.transition(ConnectionState::Open)?;

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        out_tx
            .send(Frame::Text(setup))
            .map_err(|_| LiveError::Transport("writer unavailable".to_string()))?;
        {
            // checked under the outbound lock so a concurrent close() always sees the sender
            let mut outbound = lock(&shared.outbound);
            still_open(&shared.state)?;
            *outbound = Some(out_tx);
        }

        tokio::spawn(write_loop(
            Arc::clone(shared),
            sink,
            out_rx,
            shared.stop.subscribe(),
        ));
        tokio::spawn(read_loop(Arc::clone(shared), source, shared.stop.subscribe()));

        let (mic_tx, mic_rx) = mpsc::unbounded_channel();
        if let Some(mic) = lock(&shared.mic).as_mut() {
            mic.start(mic_tx)?;
        }
        tokio::spawn(forward_mic(Arc::clone(shared), mic_rx, shared.stop.subscribe()));

        // a close() racing the task spawns must not be followed by Opened
        still_open(&shared.state)?;
        info!(target: "tale::live", session_id = %shared.session_id, "session open");
        shared.emit(LiveEvent::Opened {
            session_id: shared.session_id.clone(),
            trace_id: shared.trace_id.clone(),
        });
        Ok(())
    }

    /// Disconnect. Idempotent and non-blocking; a second call is a no-op.
    pub fn close(&self) {
        self.shared.shutdown(None);
    }

    /// Resolves once the session is CLOSED, for whatever reason.
    pub async fn closed(&self) {
        let mut stop = self.shared.stop.subscribe();
        let _ = stop.wait_for(|stopped| *stopped).await;
    }
}

impl Drop for LiveSession {
    fn drop(&mut self) {
        self.shared.shutdown(None);
    }
}

/// Fails with the transition `open` lost if a close() got in after the OPEN transition.
fn still_open(state: &StateCell) -> LiveResult<()> {
    match state.get() {
        ConnectionState::Open => Ok(()),
        from => Err(LiveError::IllegalTransition {
            from,
            to: ConnectionState::Open,
        }),
    }
}

async fn write_loop(
    shared: Arc<Shared>,
    mut sink: Box<dyn FrameSink>,
    mut frames: mpsc::UnboundedReceiver<Frame>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        let sent = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            sent = sink.send(frame) => sent,
        };
        if let Err(e) = sent {
            shared.shutdown(Some(&e));
            break;
        }
    }
    if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        debug!(target: "tale::live", session_id = %shared.session_id, "close handshake timed out");
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut source: Box<dyn FrameSource>,
    mut stop: watch::Receiver<bool>,
) {
    enum Event {
        Frame(Frame),
        Failed(LiveError),
        Gone,
        Stop,
    }

    loop {
        let event = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => Event::Stop,
            next = source.next_frame() => match next {
                Some(Ok(frame)) => Event::Frame(frame),
                Some(Err(e)) => Event::Failed(e),
                None => Event::Gone,
            },
        };

        match event {
            Event::Frame(Frame::Binary(bytes)) => shared.play(pcm16_to_f32(&bytes)),
            Event::Frame(Frame::Text(text)) => shared.on_envelope(&text),
            Event::Frame(Frame::Close) | Event::Gone => {
                info!(target: "tale::live", session_id = %shared.session_id, "remote closed");
                shared.shutdown(None);
                break;
            }
            Event::Failed(e) => {
                shared.shutdown(Some(&e));
                break;
            }
            Event::Stop => break,
        }
    }
}

async fn forward_mic(
    shared: Arc<Shared>,
    mut chunks: mpsc::UnboundedReceiver<Vec<f32>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = stop.wait_for(|stopped| *stopped) => break,
            chunk = chunks.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        if shared.send(Frame::Binary(f32_to_pcm16(&chunk))).is_err() {
            break;
        }
    }
}
