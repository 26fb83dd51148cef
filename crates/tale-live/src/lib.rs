//! # tale-live: real-time voice sessions
//!
//! A [`LiveSession`] holds one connection to the live model: PCM16 audio both ways, barge-in
//! on `interrupted`, and tool calls relayed blind to the trusted backend. Transport, playback,
//! capture and tool execution are ports, so the session runs the same against a WebSocket and
//! real devices (`device` feature) or against in-memory channels.

pub mod audio;
pub mod codec;
#[cfg(feature = "device")]
pub mod device;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod session;
pub mod state;
pub mod transport;

pub use audio::{AudioConfig, AudioSource, BufferedPlayback, MemorySource, PlaybackSink};
#[cfg(feature = "device")]
pub use device::{MicCapture, SpeakerPlayback};
pub use error::{LiveError, LiveResult};
pub use protocol::{subprotocols, ticket_from_subprotocols, PROTOCOL_TAG};
pub use relay::{HttpToolRelay, ToolRelay, ToolRelayRequest};
pub use session::{LiveConfig, LiveDeps, LiveEvent, LiveSession};
pub use state::{ConnectionState, StateCell};
pub use transport::{
    channel_transport, ChannelConnector, Connector, Frame, FrameSink, FrameSource, RemoteEnd,
    WsConnector,
};
