//! Typing indicator coordination.
//!
//! Local side: debounce-with-trailing-stop. Keystrokes produce at most one
//! "started" broadcast per debounce window, and exactly one "stopped"
//! signal fires after the idle window with no further keystrokes, so the
//! remote indicator can never get stuck on.
//!
//! Remote side: each received typing event arms a TTL deadline; whether
//! the indicator shows is a pure function of `now`, so a dropped "stopped"
//! event self-heals.

use std::time::Duration;

use tokio::time::Instant;

use fernweh_shared::constants::{TYPING_DEBOUNCE, TYPING_IDLE, TYPING_REMOTE_TTL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypingSignal {
    Started,
    Stopped,
}

#[derive(Debug)]
pub struct TypingCoordinator {
    debounce: Duration,
    idle: Duration,
    remote_ttl: Duration,
    last_broadcast: Option<Instant>,
    last_keystroke: Option<Instant>,
    /// True between an emitted Started and its trailing Stopped.
    active: bool,
    remote_until: Option<Instant>,
}

impl TypingCoordinator {
    pub fn new() -> Self {
        Self::with_windows(TYPING_DEBOUNCE, TYPING_IDLE, TYPING_REMOTE_TTL)
    }

    pub fn with_windows(debounce: Duration, idle: Duration, remote_ttl: Duration) -> Self {
        Self {
            debounce,
            idle,
            remote_ttl,
            last_broadcast: None,
            last_keystroke: None,
            active: false,
            remote_until: None,
        }
    }

    /// Called on every keystroke. Returns `Started` when a broadcast is
    /// due (first keystroke, or debounce window elapsed while still
    /// typing; the periodic re-broadcast keeps the remote TTL alive).
    pub fn note_keystroke(&mut self, now: Instant) -> Option<TypingSignal> {
        self.last_keystroke = Some(now);

        let due = match self.last_broadcast {
            None => true,
            Some(at) => now.duration_since(at) >= self.debounce,
        };
        if due {
            self.last_broadcast = Some(now);
            self.active = true;
            Some(TypingSignal::Started)
        } else {
            None
        }
    }

    /// Poll for the trailing stop. Emits `Stopped` exactly once after the
    /// idle window passes with no keystrokes.
    pub fn poll_stop(&mut self, now: Instant) -> Option<TypingSignal> {
        if !self.active {
            return None;
        }
        let idle_since = self.last_keystroke?;
        if now.duration_since(idle_since) >= self.idle {
            self.reset_local();
            Some(TypingSignal::Stopped)
        } else {
            None
        }
    }

    /// Eagerly stop (e.g. the user sent the message they were typing).
    pub fn stop_now(&mut self) -> Option<TypingSignal> {
        if self.active {
            self.reset_local();
            Some(TypingSignal::Stopped)
        } else {
            None
        }
    }

    /// Record a remote typing event. An explicit `typing = false` clears
    /// the indicator immediately; otherwise it self-expires after the TTL.
    pub fn note_remote(&mut self, typing: bool, now: Instant) {
        self.remote_until = typing.then(|| now + self.remote_ttl);
    }

    pub fn is_remote_typing(&self, now: Instant) -> bool {
        self.remote_until.is_some_and(|until| now < until)
    }

    pub fn remote_until(&self) -> Option<Instant> {
        self.remote_until
    }

    fn reset_local(&mut self) {
        self.active = false;
        self.last_broadcast = None;
    }
}

impl Default for TypingCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
