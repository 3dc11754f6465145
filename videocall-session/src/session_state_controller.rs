/*
 * Copyright 2025 Security Union LLC
 *
 * Licensed under either of
 *
 * * Apache License, Version 2.0
 *   (http://www.apache.org/licenses/LICENSE-2.0)
 * * MIT license
 *   (http://opensource.org/licenses/MIT)
 *
 * at your option.
 *
 * Unless you explicitly state otherwise, any contribution intentionally
 * submitted for inclusion in the work by you, as defined in the Apache-2.0
 * license, shall be dual licensed as above, without any additional terms or
 * conditions.
 */

//! The macro state machine gating session-level actions.
//!
//! Only one transition runs at a time. While connecting or updating, a
//! later request for Disconnect, Fail, Reconnect or Update is remembered
//! and replayed once the current transition finishes; when several arrive
//! the highest priority one wins.

use crate::errors::SessionError;
use log::{error, info, warn};
use parking_lot::Mutex;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStateControllerState {
    NotConnected,
    Connecting,
    Connected,
    Updating,
    Disconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStateControllerAction {
    Connect,
    FinishConnecting,
    Update,
    FinishUpdating,
    Reconnect,
    Disconnect,
    Fail,
    FinishDisconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum DeferPriority {
    DoNotDefer,
    Low,
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateControllerTransitionResult {
    Transitioned,
    DeferredTransition,
    NoTransitionAvailable,
    TransitionFailed,
}

impl fmt::Display for SessionStateControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Display for SessionStateControllerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

type Work = Box<dyn FnOnce() -> Result<(), SessionError> + Send>;

impl SessionStateControllerAction {
    fn defer_priority(self) -> DeferPriority {
        match self {
            SessionStateControllerAction::Disconnect => DeferPriority::VeryHigh,
            SessionStateControllerAction::Fail => DeferPriority::High,
            SessionStateControllerAction::Reconnect => DeferPriority::Medium,
            SessionStateControllerAction::Update => DeferPriority::Low,
            _ => DeferPriority::DoNotDefer,
        }
    }
}

/// The legal transitions. Reconnect re-enters `Connecting` directly.
fn next_state(
    state: SessionStateControllerState,
    action: SessionStateControllerAction,
) -> Option<SessionStateControllerState> {
    use SessionStateControllerAction as A;
    use SessionStateControllerState as S;
    match (state, action) {
        (S::NotConnected, A::Connect) => Some(S::Connecting),
        (S::Connecting, A::Fail) => Some(S::Disconnecting),
        (S::Connecting, A::FinishConnecting) => Some(S::Connected),
        (S::Connected, A::Disconnect) => Some(S::Disconnecting),
        (S::Connected, A::Reconnect) => Some(S::Connecting),
        (S::Connected, A::Fail) => Some(S::Disconnecting),
        (S::Connected, A::Update) => Some(S::Updating),
        (S::Updating, A::Fail) => Some(S::Disconnecting),
        (S::Updating, A::FinishUpdating) => Some(S::Connected),
        (S::Disconnecting, A::FinishDisconnecting) => Some(S::NotConnected),
        _ => None,
    }
}

struct Inner {
    state: SessionStateControllerState,
    deferred: Option<(SessionStateControllerAction, Work)>,
}

pub struct SessionStateController {
    inner: Mutex<Inner>,
}

impl Default for SessionStateController {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: SessionStateControllerState::NotConnected,
                deferred: None,
            }),
        }
    }
}

impl SessionStateController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SessionStateControllerState {
        self.inner.lock().state
    }

    /// Attempt `action`. On a legal transition the state changes and `work`
    /// runs; if `work` fails the state is rolled back.
    pub fn perform<F>(
        &self,
        action: SessionStateControllerAction,
        work: F,
    ) -> SessionStateControllerTransitionResult
    where
        F: FnOnce() -> Result<(), SessionError> + Send + 'static,
    {
        self.perform_boxed(action, Box::new(work))
    }

    fn perform_boxed(
        &self,
        action: SessionStateControllerAction,
        work: Work,
    ) -> SessionStateControllerTransitionResult {
        let previous = {
            let mut inner = self.inner.lock();
            let state = inner.state;
            match next_state(state, action) {
                Some(next) => {
                    info!("transitioning from {state} to {next} with {action}");
                    inner.state = next;
                    state
                }
                None if can_defer(state, action) => {
                    info!("deferring transition from {state} with {action}");
                    let replace = inner.deferred.as_ref().map_or(true, |(pending, _)| {
                        pending.defer_priority() <= action.defer_priority()
                    });
                    if replace {
                        inner.deferred = Some((action, work));
                    }
                    return SessionStateControllerTransitionResult::DeferredTransition;
                }
                None => {
                    warn!("no transition found from {state} with {action}");
                    return SessionStateControllerTransitionResult::NoTransitionAvailable;
                }
            }
        };

        if let Err(e) = work() {
            let mut inner = self.inner.lock();
            error!(
                "error during state {} with action {action}: {e}",
                inner.state
            );
            info!("rolling back transition to {previous}");
            inner.state = previous;
            return SessionStateControllerTransitionResult::TransitionFailed;
        }
        self.perform_deferred_action();
        SessionStateControllerTransitionResult::Transitioned
    }

    fn perform_deferred_action(&self) {
        let Some((action, work)) = self.inner.lock().deferred.take() else {
            return;
        };
        info!("performing deferred action {action}");
        let result = self.perform_boxed(action, work);
        if result != SessionStateControllerTransitionResult::Transitioned {
            info!(
                "unable to perform deferred action {action} in state {}",
                self.state()
            );
        }
    }
}

fn can_defer(state: SessionStateControllerState, action: SessionStateControllerAction) -> bool {
    action.defer_priority() != DeferPriority::DoNotDefer
        && matches!(
            state,
            SessionStateControllerState::Connecting | SessionStateControllerState::Updating
        )
}
