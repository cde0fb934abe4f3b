//! Silence detection: a two-state (active/idle) machine per session.
//!
//! The detector itself is synchronous. The owner arms one timer per reset
//! and hands the returned generation back in [`IdleDetector::on_timer`];
//! a timer from an older generation is stale and does nothing.

use std::time::{Duration, Instant};

/// Observable state of a session's output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Active,
    Idle,
}

/// What the owner must do after an output chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rearm {
    /// Generation to hand back when the timer fires.
    pub generation: u64,
    /// Delay before the timer fires.
    pub after: Duration,
    /// The session just left the idle state; broadcast `active`.
    pub became_active: bool,
}

#[derive(Debug)]
pub struct IdleDetector {
    threshold: Duration,
    state: Activity,
    last_output_at: Option<Instant>,
    /// Bumped on every reset so stale timers can be told apart.
    generation: u64,
    armed: bool,
}

impl IdleDetector {
    pub fn new(threshold: Duration) -> Self {
        Self {
            threshold,
            state: Activity::Active,
            last_output_at: None,
            generation: 0,
            armed: false,
        }
    }

    /// Record an output chunk at `now`.
    pub fn on_output(&mut self, now: Instant) -> Rearm {
        self.last_output_at = Some(now);
        self.generation += 1;
        self.armed = true;
        let became_active = self.state == Activity::Idle;
        self.state = Activity::Active;
        Rearm {
            generation: self.generation,
            after: self.threshold,
            became_active,
        }
    }

    /// A timer armed for `generation` fired. Returns `true` exactly when
    /// the session transitions to idle.
    pub fn on_timer(&mut self, generation: u64) -> bool {
        if !self.armed || generation != self.generation || self.state == Activity::Idle {
            return false;
        }
        self.armed = false;
        self.state = Activity::Idle;
        true
    }

    /// Change the threshold used for timers armed from now on.
    pub fn configure(&mut self, threshold: Duration) {
        self.threshold = threshold;
    }

    /// Forget any armed timer.
    pub fn disarm(&mut self) {
        self.armed = false;
        self.generation += 1;
    }

    pub fn state(&self) -> Activity {
        self.state
    }

    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn last_output_at(&self) -> Option<Instant> {
        self.last_output_at
    }
}
