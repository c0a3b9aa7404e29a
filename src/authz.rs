// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Device authorization state machine.
//!
//! The state is never stored. It is derived from the persisted attempt
//! counter, the device's MFA flag and whether the session tracker holds a
//! live session for it:
//!
//! | attempts >= lockout | enforcing_mfa | session | state |
//! |---|---|---|---|
//! | yes | any | any | `Locked` |
//! | no | false | any | `Authenticated` |
//! | no | true | yes | `Authenticated` |
//! | no | true | no | `Unauthenticated` |
//!
//! Functions here only plan transitions; [`crate::gateway::Gateway`]
//! commits them to the store and hands the enforcement part to the
//! synchronizer, all under the device's lock.

use crate::error::{GatewayError, GatewayResult};
use crate::types::{AuthorizationState, Device};

/// What enforcement must do after a transition commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enforcement {
    /// Make the device reachable.
    Grant,
    /// Terminate any session and make the device unreachable.
    Revoke,
    /// Leave the network layer alone.
    Unchanged,
}

/// Audit-facing name of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    AuthSuccess,
    AuthFailure,
    Lockout,
    AdminLock,
    AdminReset,
}

impl TransitionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AuthSuccess => "AUTH_SUCCESS",
            Self::AuthFailure => "AUTH_FAILURE",
            Self::Lockout => "LOCKOUT",
            Self::AdminLock => "ADMIN_LOCK",
            Self::AdminReset => "ADMIN_RESET",
        }
    }
}

/// A planned transition for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub event: TransitionEvent,
    pub from: AuthorizationState,
    pub to: AuthorizationState,
    /// New stored counter; `None` leaves the record untouched.
    pub attempts: Option<u32>,
    pub enforcement: Enforcement,
    /// Open a session in the tracker once the transition commits.
    pub open_session: bool,
}

impl Transition {
    pub fn is_noop(&self) -> bool {
        self.attempts.is_none() && self.enforcement == Enforcement::Unchanged && !self.open_session
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StateMachine {
    lockout: u32,
}

impl StateMachine {
    pub fn new(lockout: u32) -> Self {
        // A zero threshold would lock every device on creation.
        Self {
            lockout: lockout.max(1),
        }
    }

    pub fn lockout(&self) -> u32 {
        self.lockout
    }

    /// Counter value written by an administrative lock.
    pub fn locked_marker(&self) -> u32 {
        self.lockout.saturating_add(1)
    }

    pub fn derive(&self, device: &Device, has_session: bool) -> AuthorizationState {
        if device.is_locked(self.lockout) {
            AuthorizationState::Locked
        } else if !device.enforcing_mfa || has_session {
            AuthorizationState::Authenticated
        } else {
            AuthorizationState::Unauthenticated
        }
    }

    /// Whether enforcement should let this device forward.
    pub fn desired_reachable(&self, device: &Device, has_session: bool) -> bool {
        self.derive(device, has_session).allows_forwarding()
    }

    /// MFA completed. Rejected for locked devices.
    pub fn record_success(&self, device: &Device, has_session: bool) -> GatewayResult<Transition> {
        let from = self.derive(device, has_session);
        if from == AuthorizationState::Locked {
            return Err(GatewayError::InvalidTransition(format!(
                "device {} is locked; an administrator must reset it first",
                device.address
            )));
        }
        Ok(Transition {
            event: TransitionEvent::AuthSuccess,
            from,
            to: AuthorizationState::Authenticated,
            attempts: (device.attempts != 0).then_some(0),
            enforcement: Enforcement::Grant,
            open_session: true,
        })
    }

    /// MFA failed. Locks the device once the counter reaches the threshold.
    ///
    /// Failures below the threshold do not tear down an existing session;
    /// only lockout or an administrator does that.
    pub fn record_failure(&self, device: &Device, has_session: bool) -> Transition {
        let from = self.derive(device, has_session);
        let attempts = device.attempts.saturating_add(1);
        let locks = attempts >= self.lockout;

        Transition {
            event: if locks && from != AuthorizationState::Locked {
                TransitionEvent::Lockout
            } else {
                TransitionEvent::AuthFailure
            },
            from,
            // Below the threshold the state is unchanged: an Unauthenticated
            // device stays Unauthenticated, but one holding a session stays
            // Authenticated rather than dropping back to Unauthenticated.
            to: if locks { AuthorizationState::Locked } else { from },
            attempts: Some(attempts),
            // Re-revoking an already locked device is idempotent and heals
            // any drift left by an earlier failed revoke.
            enforcement: if locks { Enforcement::Revoke } else { Enforcement::Unchanged },
            open_session: false,
        }
    }

    /// Force the device into `Locked`. Idempotent.
    pub fn admin_lock(&self, device: &Device, has_session: bool) -> Transition {
        let marker = self.locked_marker();
        Transition {
            event: TransitionEvent::AdminLock,
            from: self.derive(device, has_session),
            to: AuthorizationState::Locked,
            attempts: (device.attempts != marker).then_some(marker),
            enforcement: Enforcement::Revoke,
            open_session: false,
        }
    }

    /// Clear the counter and require re-authentication.
    ///
    /// For devices without MFA there is nothing to re-authenticate: an
    /// unlocked one is left as is, a locked one is unlocked and regains
    /// reachability.
    pub fn admin_reset(&self, device: &Device, has_session: bool) -> Transition {
        let from = self.derive(device, has_session);
        let attempts = (device.attempts != 0).then_some(0);

        if !device.enforcing_mfa {
            let enforcement = if from == AuthorizationState::Locked {
                Enforcement::Grant
            } else {
                Enforcement::Unchanged
            };
            return Transition {
                event: TransitionEvent::AdminReset,
                from,
                to: AuthorizationState::Authenticated,
                attempts: if from == AuthorizationState::Locked { attempts } else { None },
                enforcement,
                open_session: false,
            };
        }

        Transition {
            event: TransitionEvent::AdminReset,
            from,
            to: AuthorizationState::Unauthenticated,
            attempts,
            enforcement: Enforcement::Revoke,
            open_session: false,
        }
    }
}
