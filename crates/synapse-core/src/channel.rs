//! Per-step mailbox of agent signals with an ablation kill switch.
//!
//! The channel is owned by the simulation worker. Only the [`KillSwitch`]
//! crosses threads: it is an atomic flag read fresh on every
//! [`CommunicationChannel::receive_all`], so a kill or restore issued from
//! another context is visible to the very next read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Signal type label. The discriminant is the categorical index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalType {
    Declare = 0,
    Query = 1,
    Respond = 2,
}

impl SignalType {
    pub const ALL: [SignalType; 3] = [SignalType::Declare, SignalType::Query, SignalType::Respond];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_index(i: usize) -> Option<Self> {
        Self::ALL.get(i).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            SignalType::Declare => "DECLARE",
            SignalType::Query => "QUERY",
            SignalType::Respond => "RESPOND",
        }
    }
}

/// Shared ablation flag.
#[derive(Debug, Clone, Default)]
pub struct KillSwitch(Arc<AtomicBool>);

impl KillSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag; returns `false` if it was already set.
    pub fn kill(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    /// Clear the flag; returns `false` if it was already clear.
    pub fn restore(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    pub fn is_killed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ChannelError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("agent {agent} sent a signal of length {got}, expected {expected}")]
    SignalShape {
        agent: String,
        expected: usize,
        got: usize,
    },
}

/// One recorded step: each agent's signal and type, in canonical agent order.
/// `None` means the agent had not sent during that step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommFrame {
    pub signals: Vec<Option<Vec<f64>>>,
    pub types: Vec<Option<SignalType>>,
}

impl CommFrame {
    fn empty(n: usize) -> Self {
        Self {
            signals: vec![None; n],
            types: vec![None; n],
        }
    }

    fn clear(&mut self) {
        self.signals.iter_mut().for_each(|s| *s = None);
        self.types.iter_mut().for_each(|t| *t = None);
    }

    /// Types actually sent this step.
    pub fn sent_types(&self) -> impl Iterator<Item = SignalType> + '_ {
        self.types.iter().flatten().copied()
    }
}

/// Frames recorded since the last reset, i.e. one epoch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EpochHistory {
    pub agents: Vec<String>,
    pub steps: Vec<CommFrame>,
}

impl EpochHistory {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}

pub struct CommunicationChannel {
    agents: Vec<String>,
    signal_dim: usize,
    live: CommFrame,
    history: EpochHistory,
    kill: KillSwitch,
}

impl CommunicationChannel {
    /// `agents` fixes the canonical order used by every concatenation.
    pub fn new(agents: Vec<String>, signal_dim: usize) -> Self {
        Self::with_kill_switch(agents, signal_dim, KillSwitch::new())
    }

    pub fn with_kill_switch(agents: Vec<String>, signal_dim: usize, kill: KillSwitch) -> Self {
        let n = agents.len();
        Self {
            history: EpochHistory {
                agents: agents.clone(),
                steps: Vec::new(),
            },
            agents,
            signal_dim,
            live: CommFrame::empty(n),
            kill,
        }
    }

    pub fn agents(&self) -> &[String] {
        &self.agents
    }

    pub fn signal_dim(&self) -> usize {
        self.signal_dim
    }

    pub fn kill_switch(&self) -> KillSwitch {
        self.kill.clone()
    }

    fn position(&self, agent: &str) -> Result<usize, ChannelError> {
        self.agents
            .iter()
            .position(|a| a == agent)
            .ok_or_else(|| ChannelError::UnknownAgent(agent.to_string()))
    }

    /// Store a copy of `signal`, replacing anything `agent` sent this step.
    pub fn send(
        &mut self,
        agent: &str,
        signal: &[f64],
        signal_type: SignalType,
    ) -> Result<(), ChannelError> {
        let i = self.position(agent)?;
        if signal.len() != self.signal_dim {
            return Err(ChannelError::SignalShape {
                agent: agent.to_string(),
                expected: self.signal_dim,
                got: signal.len(),
            });
        }
        self.live.signals[i] = Some(signal.to_vec());
        self.live.types[i] = Some(signal_type);
        Ok(())
    }

    /// Concatenate every other agent's current signal in canonical order.
    ///
    /// Zeros stand in for agents that have not sent and for everyone while
    /// the kill switch is set. With a single agent the result is empty.
    pub fn receive_all(&self, agent: &str) -> Vec<f64> {
        let killed = self.kill.is_killed();
        let mut out = Vec::with_capacity(self.signal_dim * self.agents.len().saturating_sub(1));
        for (name, slot) in self.agents.iter().zip(&self.live.signals) {
            if name == agent {
                continue;
            }
            match slot {
                Some(sig) if !killed => out.extend_from_slice(sig),
                _ => out.extend(std::iter::repeat(0.0).take(self.signal_dim)),
            }
        }
        out
    }

    /// Append a snapshot of the live frame to the epoch history.
    pub fn record_step(&mut self) {
        self.history.steps.push(self.live.clone());
    }

    /// Empty the live frame. History is untouched.
    pub fn clear(&mut self) {
        self.live.clear();
    }

    /// Drop history and the live frame and lift the kill switch.
    pub fn reset(&mut self) {
        self.live.clear();
        self.history.steps.clear();
        self.kill.restore();
    }

    pub fn kill(&self) -> bool {
        self.kill.kill()
    }

    pub fn restore(&self) -> bool {
        self.kill.restore()
    }

    pub fn is_killed(&self) -> bool {
        self.kill.is_killed()
    }

    pub fn history(&self) -> &EpochHistory {
        &self.history
    }
}
