//! Remote-play relay core: terminates a console streaming protocol and
//! republishes audio/video plus a control channel to the browser over
//! WebRTC.

pub mod args;
pub mod audio;
pub mod av_handler;
pub mod cipher;
pub mod codec;
pub mod config;
pub mod control;
pub mod fec;
pub mod handshake;
pub mod health;
pub mod reorder;
pub mod video;
pub mod web;
pub mod webrtc;

pub use av_handler::{AvHandler, AvHandlerConfig, AvReceiver};
pub use config::{Config, VideoCodec};
pub use handshake::{Handshake, HandshakeState};
pub use health::{HealthSupervisor, StreamHealthSnapshot};
pub use webrtc::{SessionManager, WebRTCSession};
