//! # Audio Module
//!
//! Per-guild playback for the bot.
//!
//! ## Architecture
//!
//! ### [`service`] - Audio Service
//! - Owns one [`GuildAudioState`] per guild behind its own async lock
//! - Decides what plays next and hands it to the backend
//! - Fires [`PlaybackHooks`] when a track starts or the queue runs dry
//!
//! ### [`backend`] - Audio Backends
//! - [`LocalBackend`]: Songbird transcodes and streams the track itself
//! - [`LavalinkBackend`]: a remote Lavalink node streams, Songbird only negotiates voice
//! - [`HybridBackend`]: the node searches, Songbird plays
//!
//! The backend is picked once at startup from `AUDIO_BACKEND`.

pub mod backend;
pub mod hooks;
pub mod hybrid;
pub mod lavalink;
pub mod lavalink_client;
pub mod local;
pub mod service;
pub mod state;

pub use backend::{AudioBackend, AudioError, TrackEndCallback};
pub use hooks::{PlaybackEvent, PlaybackHooks};
pub use hybrid::HybridBackend;
pub use lavalink::LavalinkBackend;
pub use lavalink_client::LavalinkClient;
pub use local::LocalBackend;
pub use service::AudioService;
pub use state::{AudioStatus, GuildAudioState};
