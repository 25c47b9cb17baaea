//! Run lifecycle state machine.
//!
//! ```text
//! pending → running ⇄ paused
//! running | paused → completed | stopped | failed   (terminal)
//! ```
//!
//! Control calls come from any thread and never wait on the worker. They
//! validate against the current state and record intent; the worker observes
//! it at epoch boundaries through [`RunController::wait_at_boundary`].
//! All lifecycle bookkeeping sits behind one `watch` channel, so status reads
//! are a single short borrow and async observers can subscribe to changes.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use synapse_ledger::RunStatus;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};

use crate::channel::KillSwitch;
use crate::domain::{Result, SynapseError};

/// How often a paused worker re-checks for resume or stop.
pub const DEFAULT_PAUSE_POLL: Duration = Duration::from_millis(100);

/// Snapshot of lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunLifecycle {
    pub status: RunStatus,
    /// Set by `stop`; honoured at the next epoch boundary.
    pub stop_requested: bool,
    pub epochs_completed: u64,
    pub failure: Option<String>,
}

/// Result of a control call. Inapplicable calls are reported, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ControlOutcome {
    Applied,
    Ignored { reason: String },
}

impl ControlOutcome {
    fn ignored(reason: impl Into<String>) -> Self {
        ControlOutcome::Ignored {
            reason: reason.into(),
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, ControlOutcome::Applied)
    }
}

/// Terminal state the worker reports when the engine exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Completed,
    Stopped,
    Failed(String),
}

impl Terminal {
    pub fn status(&self) -> RunStatus {
        match self {
            Terminal::Completed => RunStatus::Completed,
            Terminal::Stopped => RunStatus::Stopped,
            Terminal::Failed(_) => RunStatus::Failed,
        }
    }
}

/// What the worker should do at an epoch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boundary {
    Proceed,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSwitchAction {
    Kill,
    Restore,
}

/// One applied kill or restore.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitchEvent {
    /// Index of the epoch in progress (or next to run) when applied.
    pub epoch: u64,
    pub action: KillSwitchAction,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

pub struct RunController {
    state: watch::Sender<RunLifecycle>,
    kill: KillSwitch,
    kill_events: Mutex<Vec<KillSwitchEvent>>,
    limiter: Option<Arc<Semaphore>>,
    limit: usize,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
    poll_interval: Duration,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl RunController {
    /// A `pending` controller. `limiter` is shared by every run that counts
    /// against the same active-run cap.
    pub fn new(kill: KillSwitch, limiter: Option<(Arc<Semaphore>, usize)>) -> Self {
        let (state, _) = watch::channel(RunLifecycle {
            status: RunStatus::Pending,
            stop_requested: false,
            epochs_completed: 0,
            failure: None,
        });
        let (limiter, limit) = match limiter {
            Some((sem, limit)) => (Some(sem), limit),
            None => (None, 0),
        };
        Self {
            state,
            kill,
            kill_events: Mutex::new(Vec::new()),
            limiter,
            limit,
            permit: Mutex::new(None),
            poll_interval: DEFAULT_PAUSE_POLL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn snapshot(&self) -> RunLifecycle {
        self.state.borrow().clone()
    }

    pub fn status(&self) -> RunStatus {
        self.state.borrow().status
    }

    pub fn subscribe(&self) -> watch::Receiver<RunLifecycle> {
        self.state.subscribe()
    }

    /// `pending → running`, taking a slot from the active-run limiter.
    pub fn start(&self) -> Result<ControlOutcome> {
        let current = self.status();
        if current != RunStatus::Pending {
            return Ok(ControlOutcome::ignored(format!("cannot start a {current} run")));
        }
        // A racing start that loses below drops its permit on return.
        let permit = match &self.limiter {
            Some(sem) => Some(
                sem.clone()
                    .try_acquire_owned()
                    .map_err(|_| SynapseError::ConcurrencyRejection { limit: self.limit })?,
            ),
            None => None,
        };

        let mut from = RunStatus::Pending;
        let started = self.state.send_if_modified(|s| {
            from = s.status;
            if s.status == RunStatus::Pending {
                s.status = RunStatus::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Ok(ControlOutcome::ignored(format!("cannot start a {from} run")));
        }
        *lock(&self.permit) = permit;
        Ok(ControlOutcome::Applied)
    }

    /// `running → paused`. Takes effect before the next epoch starts.
    pub fn pause(&self) -> ControlOutcome {
        self.transition(|s| match s.status {
            RunStatus::Running if s.stop_requested => Err("stop already requested".into()),
            RunStatus::Running => {
                s.status = RunStatus::Paused;
                Ok(())
            }
            other => Err(format!("cannot pause a {other} run")),
        })
    }

    /// `paused → running`.
    pub fn resume(&self) -> ControlOutcome {
        self.transition(|s| match s.status {
            RunStatus::Paused if s.stop_requested => Err("stop already requested".into()),
            RunStatus::Paused => {
                s.status = RunStatus::Running;
                Ok(())
            }
            other => Err(format!("cannot resume a {other} run")),
        })
    }

    /// Request a stop from `running` or `paused`, honoured at the next epoch
    /// boundary.
    pub fn stop(&self) -> ControlOutcome {
        self.transition(|s| match s.status {
            RunStatus::Running | RunStatus::Paused if s.stop_requested => {
                Err("stop already requested".into())
            }
            RunStatus::Running | RunStatus::Paused => {
                s.stop_requested = true;
                Ok(())
            }
            other => Err(format!("cannot stop a {other} run")),
        })
    }

    fn transition<F>(&self, f: F) -> ControlOutcome
    where
        F: FnOnce(&mut RunLifecycle) -> std::result::Result<(), String>,
    {
        let mut outcome = ControlOutcome::Applied;
        self.state.send_if_modified(|s| match f(s) {
            Ok(()) => true,
            Err(reason) => {
                outcome = ControlOutcome::ignored(reason);
                false
            }
        });
        outcome
    }

    /// Zero inter-agent signals from the next channel read on.
    pub fn kill_communication(&self, reason: Option<String>) -> ControlOutcome {
        if !self.kill.kill() {
            return ControlOutcome::ignored("communication already killed");
        }
        self.log_kill_switch(KillSwitchAction::Kill, reason);
        ControlOutcome::Applied
    }

    pub fn restore_communication(&self, reason: Option<String>) -> ControlOutcome {
        if !self.kill.restore() {
            return ControlOutcome::ignored("communication is not killed");
        }
        self.log_kill_switch(KillSwitchAction::Restore, reason);
        ControlOutcome::Applied
    }

    fn log_kill_switch(&self, action: KillSwitchAction, reason: Option<String>) {
        let epoch = self.state.borrow().epochs_completed;
        lock(&self.kill_events).push(KillSwitchEvent {
            epoch,
            action,
            reason,
            at: Utc::now(),
        });
    }

    pub fn is_comm_killed(&self) -> bool {
        self.kill.is_killed()
    }

    pub fn kill_switch_events(&self) -> Vec<KillSwitchEvent> {
        lock(&self.kill_events).clone()
    }

    // -- worker side ---------------------------------------------------------

    /// Block until the next epoch may start or the run must end.
    ///
    /// Returns at once while running; while paused re-checks every poll
    /// interval. A pending stop wins over pause.
    pub fn wait_at_boundary(&self) -> Boundary {
        loop {
            let (status, stop_requested) = {
                let s = self.state.borrow();
                (s.status, s.stop_requested)
            };
            if stop_requested {
                return Boundary::Stop;
            }
            match status {
                RunStatus::Running => return Boundary::Proceed,
                RunStatus::Paused => std::thread::sleep(self.poll_interval),
                _ => return Boundary::Stop,
            }
        }
    }

    pub fn record_epoch(&self, epochs_completed: u64) {
        self.state.send_modify(|s| s.epochs_completed = epochs_completed);
    }

    /// Enter a terminal state. Returns `false` if one was already reached.
    pub fn finish(&self, terminal: Terminal) -> bool {
        let applied = self.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.status = terminal.status();
            if let Terminal::Failed(reason) = &terminal {
                s.failure = Some(reason.clone());
            }
            true
        });
        if applied {
            lock(&self.permit).take();
        }
        applied
    }
}
