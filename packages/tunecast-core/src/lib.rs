//! Tunecast Core - session orchestration for a receiver-to-HLS bridge.
//!
//! This crate drives a pool of external media transcoders that repackage
//! live broadcast or recorded MPEG-TS streams from an Enigma2/OpenWebIF
//! style receiver into HLS output for modern players. It is consumed by the
//! standalone worker binary; the HTTP surface that creates intents and
//! serves playlists lives outside this crate and talks to it only through
//! the store and the bus.
//!
//! # Architecture
//!
//! - [`orchestrator`]: the FSM driver - intents in, supervised sessions out
//! - [`store`]: durable session records, idempotency keys and TTL leases
//! - [`bus`]: in-process intent pub/sub with bounded subscriber queues
//! - [`sweeper`]: background GC of sessions, leases and output directories
//! - [`transcoder`]: external process lifecycle (ffmpeg implementation)
//! - [`tuner`]: receiver attention contract
//! - [`reason`]: closed failure taxonomy and classification
//! - [`metrics`]: low-cardinality counters and histograms
//! - [`layout`] / [`outbound`]: filesystem and URL safety rails
//!
//! # Abstraction traits
//!
//! [`Tuner`](tuner::Tuner), [`Transcoder`](transcoder::Transcoder) /
//! [`TranscoderFactory`](transcoder::TranscoderFactory) and
//! [`SessionStore`](store::SessionStore) are the seams: production wiring
//! uses the receiver client, ffmpeg and sled; tests substitute stubs and
//! the in-memory store.

#![warn(clippy::all)]

pub mod bus;
pub mod config;
pub mod events;
pub mod layout;
pub mod metrics;
pub mod orchestrator;
pub mod outbound;
pub mod reason;
pub mod session;
pub mod store;
pub mod sweeper;
pub mod transcoder;
pub mod tuner;
pub mod utils;

// Re-export commonly used types at the crate root
pub use bus::{Bus, Subscription};
pub use config::{Config, ReadinessTimeouts};
pub use events::{Intent, StartIntent, StopIntent, TOPIC_START, TOPIC_STOP};
pub use layout::HlsLayout;
pub use orchestrator::{Orchestrator, StartRequest};
pub use outbound::{OutboundGuard, OutboundPolicy};
pub use reason::{ReasonCode, ReasonError};
pub use session::{
    PipelineState, SessionMode, SessionRecord, SessionState, StreamProfile,
};
pub use store::instrumented::InstrumentedStore;
pub use store::memory::MemoryStore;
pub use store::sled::SledStore;
pub use store::{SessionFilter, SessionStore, StoreError};
pub use sweeper::Sweeper;
pub use transcoder::{
    FfmpegConfig, FfmpegTranscoderFactory, Transcoder, TranscoderFactory,
};
pub use tuner::{PassthroughTuner, Tuner, TunerError};
pub use utils::{now_millis, now_unix};
