//! Offer/answer signaling
//!
//! - [`barrier`]: wait/notify gate bridging engine callbacks and request threads
//! - [`factory`]: session creation and per-negotiation callback context
//! - [`session`]: the negotiation state machine

pub mod barrier;
pub mod factory;
pub mod session;

pub use barrier::{NegotiationBarrier, WaitOutcome};
pub use factory::{BitrateCaps, MediaSession, MediaSessionFactory, NegotiationContext};
pub use session::{AbortHandle, NegotiationPhase, SignalingSession};
