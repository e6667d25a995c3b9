//! Offer/answer state machine for the single active negotiation
//!
//! `Idle -> Negotiating -> AwaitingIce -> Ready -> Closed`. The transient
//! phases only exist while an offer is being handled, so each one is its own
//! type and every transition consumes the current phase and returns the next.
//! A failed transition hands its session back so it can be torn down.

use crate::errors::SignalingError;
use crate::signaling::barrier::WaitOutcome;
use crate::signaling::factory::{MediaSession, MediaSessionFactory, NegotiationContext};
use crate::types::{IceGatheringState, SdpType, SessionDescription};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Observable phase of the signaling session
///
/// The in-flight steps are the [`Negotiating`] and [`AwaitingIce`]
/// typestates. They only exist inside `handle_offer`, which holds `&mut self`,
/// so no caller can observe them here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NegotiationPhase {
    Idle,
    Ready,
    Closed,
}

/// A transition that did not complete, with the session it leaves behind
pub struct FailedTransition {
    session: MediaSession,
    error: SignalingError,
}

/// Session created, remote offer not yet applied
pub struct Negotiating(MediaSession);

/// Local answer installed, ICE gathering in progress
pub struct AwaitingIce(MediaSession);

/// Gathering finished, final local description available
pub struct Ready(MediaSession);

impl Negotiating {
    pub fn new(session: MediaSession) -> Self {
        Self(session)
    }

    /// Install the remote offer and generate the local answer. The gathering
    /// barrier is armed before answer generation begins, so a completion that
    /// fires inline with `set_local_description` is kept.
    pub fn accept_offer(self, offer: &SessionDescription) -> Result<AwaitingIce, FailedTransition> {
        let session = self.0;
        let handle = Arc::clone(session.handle());

        if let Err(e) = handle.set_remote_description(offer) {
            return Err(FailedTransition {
                session,
                error: SignalingError::RemoteDescriptionRejected(e),
            });
        }

        session.context().gathering().arm();

        let answer = match handle.create_answer() {
            Ok(answer) => answer,
            Err(e) => {
                return Err(FailedTransition {
                    session,
                    error: SignalingError::AnswerGeneration(e),
                })
            }
        };
        if let Err(e) = handle.set_local_description(&answer) {
            return Err(FailedTransition {
                session,
                error: SignalingError::AnswerGeneration(e),
            });
        }

        log::debug!(
            "Session {}: generated initial answer ({} candidates)",
            session.id(),
            answer.candidate_count()
        );
        Ok(AwaitingIce(session))
    }
}

impl AwaitingIce {
    /// Block until ICE gathering completes, the timeout elapses or the
    /// negotiation is cancelled
    pub fn await_gathering(self, timeout: Option<Duration>) -> Result<Ready, FailedTransition> {
        let session = self.0;

        if session.handle().ice_gathering_state() == IceGatheringState::Complete {
            log::debug!("Session {}: ICE gathering already complete", session.id());
            return Ok(Ready(session));
        }

        log::debug!("Session {}: waiting for ICE gathering to complete", session.id());
        match session.context().gathering().await_signal(timeout) {
            WaitOutcome::Signaled | WaitOutcome::AlreadySignaled => {
                log::debug!("Session {}: ICE gathering completed", session.id());
                Ok(Ready(session))
            }
            WaitOutcome::TimedOut => Err(FailedTransition {
                session,
                error: SignalingError::NegotiationTimeout(timeout.unwrap_or_default()),
            }),
            WaitOutcome::Cancelled => Err(FailedTransition {
                session,
                error: SignalingError::InterruptedWait,
            }),
        }
    }
}

impl Ready {
    /// The post-gathering local description
    pub fn answer(&self) -> Result<SessionDescription, SignalingError> {
        self.0
            .handle()
            .local_description()
            .ok_or(SignalingError::MissingLocalDescription)
    }

    pub fn session(&self) -> &MediaSession {
        &self.0
    }
}

enum NegotiationState {
    Idle,
    Ready(Ready),
    Closed,
}

/// Lets another thread cancel the in-flight gathering wait without taking the
/// session lock
#[derive(Clone, Default)]
pub struct AbortHandle {
    inner: Arc<AbortShared>,
}

#[derive(Default)]
struct AbortShared {
    shutdown: AtomicBool,
    current: Mutex<Option<Arc<NegotiationContext>>>,
}

impl AbortHandle {
    /// Mark the bridge as shut down and release any waiting request
    pub fn abort(&self) {
        let mut current = self.inner.current.lock();
        self.inner.shutdown.store(true, Ordering::Release);
        if let Some(context) = current.take() {
            log::info!("Cancelling in-flight negotiation {}", context.id());
            context.gathering().cancel();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.shutdown.load(Ordering::Acquire)
    }

    /// Register the negotiation that a later `abort` must cancel. Returns
    /// false when the bridge is already shut down.
    fn track(&self, context: &Arc<NegotiationContext>) -> bool {
        let mut current = self.inner.current.lock();
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        *current = Some(Arc::clone(context));
        true
    }

    fn untrack(&self) {
        self.inner.current.lock().take();
    }
}

/// Owns at most one active negotiation
pub struct SignalingSession {
    factory: MediaSessionFactory,
    state: NegotiationState,
    ice_timeout: Option<Duration>,
    abort: AbortHandle,
}

impl SignalingSession {
    pub fn new(factory: MediaSessionFactory, ice_timeout: Option<Duration>) -> Self {
        Self {
            factory,
            state: NegotiationState::Idle,
            ice_timeout,
            abort: AbortHandle::default(),
        }
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    pub fn phase(&self) -> NegotiationPhase {
        match self.state {
            NegotiationState::Idle => NegotiationPhase::Idle,
            NegotiationState::Ready(_) => NegotiationPhase::Ready,
            NegotiationState::Closed => NegotiationPhase::Closed,
        }
    }

    /// Session backing the current answer, if any
    pub fn active_session(&self) -> Option<&MediaSession> {
        match &self.state {
            NegotiationState::Ready(ready) => Some(ready.session()),
            _ => None,
        }
    }

    pub fn active_session_id(&self) -> Option<&str> {
        self.active_session().map(MediaSession::id)
    }

    pub fn active_since(&self) -> Option<DateTime<Utc>> {
        self.active_session().map(MediaSession::created_at)
    }

    /// Drive one offer to a final, fully gathered answer
    ///
    /// A malformed offer is rejected before anything is touched. Otherwise the
    /// previous session is disposed first, since the published tracks can only
    /// be bound to one session at a time.
    pub fn handle_offer(&mut self, offer: &SessionDescription) -> Result<SessionDescription, SignalingError> {
        if offer.sdp_type != SdpType::Offer {
            return Err(SignalingError::MalformedRequest(format!(
                "expected an offer, got {}",
                offer.sdp_type
            )));
        }
        if offer.sdp.trim().is_empty() {
            return Err(SignalingError::MalformedRequest("empty SDP".to_string()));
        }
        if self.abort.is_aborted() {
            return Err(SignalingError::Shutdown);
        }

        self.teardown("superseded by new offer");

        let session = match self.factory.create_session() {
            Ok(session) => session,
            Err(e) => {
                log::error!("Failed to create session: {}", e);
                self.state = NegotiationState::Closed;
                return Err(e);
            }
        };
        if !self.abort.track(session.context()) {
            session.close();
            self.state = NegotiationState::Closed;
            return Err(SignalingError::Shutdown);
        }
        log::info!("Negotiating session {}", session.id());

        let awaiting = Negotiating::new(session)
            .accept_offer(offer)
            .map_err(|failed| self.fail(failed))?;
        let ready = awaiting
            .await_gathering(self.ice_timeout)
            .map_err(|failed| self.fail(failed))?;

        let answer = match ready.answer() {
            Ok(answer) => answer,
            Err(e) => {
                return Err(self.fail(FailedTransition {
                    session: ready.0,
                    error: e,
                }))
            }
        };

        self.abort.untrack();
        log::info!(
            "Session {} ready, final answer carries {} candidate(s)",
            ready.session().id(),
            answer.candidate_count()
        );
        self.state = NegotiationState::Ready(ready);
        Ok(answer)
    }

    /// Dispose the active session and release any waiter. Idempotent.
    pub fn shutdown(&mut self) {
        self.abort.abort();
        self.teardown("shutdown");
        self.state = NegotiationState::Closed;
    }

    fn fail(&mut self, failed: FailedTransition) -> SignalingError {
        log::error!("Session {} failed: {}", failed.session.id(), failed.error);
        self.abort.untrack();
        failed.session.close();
        self.state = NegotiationState::Closed;
        failed.error
    }

    fn teardown(&mut self, reason: &str) {
        if let NegotiationState::Ready(ready) = std::mem::replace(&mut self.state, NegotiationState::Idle) {
            log::info!("Closing session {}: {}", ready.session().id(), reason);
            ready.0.close();
        }
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.teardown("dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NegotiationConfig;
    use crate::testing::{sample_offer, LoopbackEngine, LoopbackScript};
    use crate::types::{IceConnectionState, MediaKind};
    use std::time::Instant;

    fn session_with(script: LoopbackScript, timeout: Option<Duration>) -> (Arc<LoopbackEngine>, SignalingSession) {
        let engine = Arc::new(LoopbackEngine::with_script(script));
        let config = NegotiationConfig {
            enable_audio: true,
            ..NegotiationConfig::default()
        };
        let factory = MediaSessionFactory::new(engine.clone(), &config).unwrap();
        (engine, SignalingSession::new(factory, timeout))
    }

    #[test]
    fn test_answer_is_taken_after_gathering() {
        let (engine, mut session) = session_with(LoopbackScript::default(), Some(Duration::from_secs(5)));
        assert_eq!(session.phase(), NegotiationPhase::Idle);

        let answer = session.handle_offer(&sample_offer()).unwrap();
        assert_eq!(answer.sdp_type, SdpType::Answer);
        assert_eq!(answer.candidate_count(), 2);
        assert_eq!(session.phase(), NegotiationPhase::Ready);
        assert_eq!(engine.live_sessions(), 1);

        let handle = session.active_session().unwrap().handle();
        assert_eq!(handle.ice_gathering_state(), IceGatheringState::Complete);
    }

    #[test]
    fn test_inline_completion_skips_wait() {
        let script = LoopbackScript {
            complete_inline: true,
            ..LoopbackScript::default()
        };
        let (_engine, mut session) = session_with(script, None);

        let start = Instant::now();
        let answer = session.handle_offer(&sample_offer()).unwrap();
        assert!(start.elapsed() < Duration::from_millis(500));
        assert_eq!(answer.candidate_count(), 2);
    }

    #[test]
    fn test_non_offer_leaves_active_session_untouched() {
        let (engine, mut session) = session_with(LoopbackScript::default(), Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();
        let active = session.active_session_id().unwrap().to_string();

        let err = session
            .handle_offer(&SessionDescription::answer("x"))
            .unwrap_err();
        assert!(matches!(err, SignalingError::MalformedRequest(_)));
        assert_eq!(err.status_code(), 400);

        let err = session.handle_offer(&SessionDescription::offer("  ")).unwrap_err();
        assert!(matches!(err, SignalingError::MalformedRequest(_)));

        assert_eq!(session.active_session_id(), Some(active.as_str()));
        assert_eq!(session.phase(), NegotiationPhase::Ready);
        assert_eq!(engine.live_sessions(), 1);
        assert_eq!(engine.sessions_created(), 1);
    }

    #[test]
    fn test_new_offer_supersedes_previous_session() {
        let (engine, mut session) = session_with(LoopbackScript::default(), Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();
        let first = session.active_session_id().unwrap().to_string();

        session.handle_offer(&sample_offer()).unwrap();
        let second = session.active_session_id().unwrap().to_string();

        assert_ne!(first, second);
        assert_eq!(engine.sessions_created(), 2);
        assert_eq!(engine.live_sessions(), 1);
    }

    #[test]
    fn test_gathering_timeout_closes_session() {
        let script = LoopbackScript {
            never_complete: true,
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, Some(Duration::from_millis(60)));

        let err = session.handle_offer(&sample_offer()).unwrap_err();
        assert!(matches!(err, SignalingError::NegotiationTimeout(_)));
        assert_eq!(err.status_code(), 504);
        assert_eq!(session.phase(), NegotiationPhase::Closed);
        assert_eq!(engine.live_sessions(), 0);
    }

    fn failing_offer(script: LoopbackScript) -> SignalingError {
        let (engine, mut session) = session_with(script, Some(Duration::from_secs(5)));
        let err = session.handle_offer(&sample_offer()).unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert_eq!(session.phase(), NegotiationPhase::Closed);
        assert_eq!(engine.live_sessions(), 0);
        err
    }

    #[test]
    fn test_engine_failures_abort_to_closed() {
        let err = failing_offer(LoopbackScript {
            fail_session_creation: true,
            ..LoopbackScript::default()
        });
        assert!(matches!(err, SignalingError::SessionCreation(_)));

        let err = failing_offer(LoopbackScript {
            reject_remote_description: true,
            ..LoopbackScript::default()
        });
        assert!(matches!(err, SignalingError::RemoteDescriptionRejected(_)));

        let err = failing_offer(LoopbackScript {
            fail_answer: true,
            ..LoopbackScript::default()
        });
        assert!(matches!(err, SignalingError::AnswerGeneration(_)));

        let err = failing_offer(LoopbackScript {
            lose_local_description: true,
            ..LoopbackScript::default()
        });
        assert!(matches!(err, SignalingError::MissingLocalDescription));
    }

    #[test]
    fn test_recovers_after_failed_offer() {
        let script = LoopbackScript {
            reject_remote_description: true,
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, Some(Duration::from_secs(5)));
        assert!(session.handle_offer(&sample_offer()).is_err());

        engine.set_script(LoopbackScript::default());
        assert!(session.handle_offer(&sample_offer()).is_ok());
        assert_eq!(session.phase(), NegotiationPhase::Ready);
    }

    #[test]
    fn test_abort_releases_unbounded_wait() {
        let script = LoopbackScript {
            never_complete: true,
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, None);
        let abort = session.abort_handle();

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            abort.abort();
        });

        let err = session.handle_offer(&sample_offer()).unwrap_err();
        canceller.join().unwrap();
        assert!(matches!(err, SignalingError::InterruptedWait));
        assert_eq!(engine.live_sessions(), 0);

        assert!(matches!(
            session.handle_offer(&sample_offer()),
            Err(SignalingError::Shutdown)
        ));
    }

    #[test]
    fn test_bitrate_caps_applied_once_connected() {
        let script = LoopbackScript {
            connect_after: Some(Duration::from_millis(20)),
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();

        let loopback = engine.last_session().unwrap();

        let context = Arc::clone(session.active_session().unwrap().context());
        let deadline = Instant::now() + Duration::from_secs(2);
        while loopback.bitrate_updates() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert_eq!(context.connection_state(), IceConnectionState::Connected);
        assert_eq!(loopback.max_bitrate(MediaKind::Video), Some(4000));
        assert_eq!(loopback.max_bitrate(MediaKind::Audio), Some(64));
        assert_eq!(context.gathered_candidates(), 2);
    }

    #[test]
    fn test_no_caps_before_connected() {
        let (engine, mut session) = session_with(LoopbackScript::default(), Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();

        let loopback = engine.last_session().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(loopback.max_bitrate(MediaKind::Video), None);
        assert_eq!(loopback.bitrate_updates(), 0);
        assert!(!session.active_session().unwrap().context().bitrate_caps_applied());
    }

    #[test]
    fn test_caps_not_reissued_on_completed() {
        let script = LoopbackScript {
            connect_after: Some(Duration::from_millis(10)),
            report_completed: true,
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();

        let context = Arc::clone(session.active_session().unwrap().context());
        let loopback = engine.last_session().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while (loopback.bitrate_updates() < 2 || context.connection_state() != IceConnectionState::Completed)
            && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(context.connection_state(), IceConnectionState::Completed);
        // One call per sender, from the Connected report only
        assert_eq!(loopback.bitrate_updates(), 2);
    }

    #[test]
    fn test_caps_retried_when_senders_were_not_ready() {
        let script = LoopbackScript {
            connect_after: Some(Duration::from_millis(10)),
            report_completed: true,
            senders_ready_late: true,
            ..LoopbackScript::default()
        };
        let (engine, mut session) = session_with(script, Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();

        let context = Arc::clone(session.active_session().unwrap().context());
        let loopback = engine.last_session().unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while loopback.bitrate_updates() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }

        assert!(context.bitrate_caps_applied());
        assert_eq!(loopback.max_bitrate(MediaKind::Video), Some(4000));
        assert_eq!(loopback.max_bitrate(MediaKind::Audio), Some(64));
        assert_eq!(loopback.bitrate_updates(), 2);
    }

    #[test]
    fn test_shutdown_closes_active_session() {
        let (engine, mut session) = session_with(LoopbackScript::default(), Some(Duration::from_secs(5)));
        session.handle_offer(&sample_offer()).unwrap();

        session.shutdown();
        session.shutdown();
        assert_eq!(session.phase(), NegotiationPhase::Closed);
        assert!(session.active_session_id().is_none());
        assert_eq!(engine.live_sessions(), 0);
    }
}
