//! Collaborator seam to the hosted state-machine library.
//!
//! The unit hosts exactly one long-lived machine actor. The machine
//! library itself is external; the runtime reaches it through these
//! traits:
//!
//! - [`MachineHandle`]: the running actor (session id + event delivery)
//! - [`MachineSystem`]: the surrounding actor system, whose internal
//!   relay primitive is used when available
//! - [`MachineClock`]: the timer source the library consults for delayed
//!   transitions; [`NOOP_CLOCK`] is installed so that every real delay
//!   flows through the durable alarm queue instead

use std::sync::atomic::{AtomicU64, Ordering};

use burrow_core::{Error, Result};
use serde_json::Value;

/// Handle to the hosted machine actor.
pub trait MachineHandle: Send + Sync {
    /// Stable session identifier of the running actor.
    fn session_id(&self) -> &str;

    /// Deliver an event to the actor's mailbox.
    ///
    /// # Errors
    ///
    /// Returns an error if the actor is gone or its mailbox is closed.
    fn send(&self, event: Value) -> Result<()>;
}

/// Outcome of a relay attempt through the actor system.
#[derive(Debug)]
pub enum RelayOutcome {
    /// The system accepted the event.
    Delivered,
    /// The system exposes no relay primitive; fall back to direct send.
    Unsupported,
    /// The relay primitive exists but failed.
    Failed(Error),
}

/// The actor system surrounding the hosted machine.
///
/// Some library versions expose an internal relay primitive with richer
/// delivery semantics than the public send. Systems without one return
/// [`RelayOutcome::Unsupported`] and callers degrade to
/// [`MachineHandle::send`].
pub trait MachineSystem: Send + Sync {
    /// Relay an event from `source` to `target` through the system.
    fn relay(
        &self,
        source: &dyn MachineHandle,
        target: &dyn MachineHandle,
        event: Value,
    ) -> RelayOutcome;
}

/// Actor system with no relay primitive.
#[derive(Debug, Clone, Copy, Default)]
pub struct SendOnlySystem;

impl MachineSystem for SendOnlySystem {
    fn relay(
        &self,
        _source: &dyn MachineHandle,
        _target: &dyn MachineHandle,
        _event: Value,
    ) -> RelayOutcome {
        RelayOutcome::Unsupported
    }
}

/// The timer source the machine library consults for delayed transitions.
pub trait MachineClock: Send + Sync {
    /// Request a timer. Returns an opaque non-zero token.
    fn set_timeout(&self, delay_ms: u64) -> u64;

    /// Cancel a previously requested timer.
    fn clear_timeout(&self, token: u64);
}

/// Clock that never fires.
///
/// Installed as the machine library's timer source while the durable
/// queue is active: `set_timeout` hands back a fresh token and nothing
/// else happens, so the library's own timers are inert.
#[derive(Debug)]
pub struct NoopClock {
    next_token: AtomicU64,
}

/// The installable no-op clock instance.
pub static NOOP_CLOCK: NoopClock = NoopClock::new();

impl NoopClock {
    /// Create a fresh no-op clock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
        }
    }
}

impl Default for NoopClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MachineClock for NoopClock {
    fn set_timeout(&self, _delay_ms: u64) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    fn clear_timeout(&self, _token: u64) {}
}
