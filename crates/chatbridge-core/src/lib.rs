//! Chatbridge Core - stream reconciliation and credential rotation.
//!
//! This crate holds the serving-side engines behind the OpenAI-compatible
//! facade: the event model and queue that decoded wire traffic flows
//! through, the per-session stream consumer that orders and terminates
//! generations exactly once, and the rotation controller that swaps
//! credential profiles under cooldown and usage policy.
//!
//! ## Architecture
//!
//! ```text
//! browser traffic → WireDecoder → EventQueue → StreamConsumer → SSE chunks
//!                        │                          │
//!                        └── quota signal ──→ RotationController
//!                                                  │ (pipeline gate)
//!                                          RequestCoordinator
//! ```
//!
//! All cross-task flags live in a single [`CoordinationContext`] shared by
//! `Arc`; the browser-automation layer is reached only through the
//! [`browser::BrowserPort`] trait.

pub mod boundary;
pub mod browser;
pub mod config;
pub mod consumer;
pub mod context;
pub mod event;
pub mod queue;
pub mod rotation;
pub mod session;

pub use browser::{BrowserPort, DisconnectProbe};
pub use config::{RotationConfig, StreamConfig};
pub use consumer::StreamConsumer;
pub use context::{CoordinationContext, QuotaSignal};
pub use event::{FunctionCall, GenerationEvent, NormalizedEvent, TerminalReason};
pub use queue::{EventQueue, EventSink};
pub use rotation::{
    discover_profiles, select_candidate, AuthProfile, ProfileTier, QuotaFailure,
    RotationController, RotationError, RotationStatus,
};
pub use session::StreamSession;
