//! Orchestrator state machine and the cancellation token signal handlers set.

use anyhow::Result;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Progress of one build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Init,
    DeviceAllocated,
    Partitioned,
    Formatted,
    Staged,
    Unmounted,
    Packaged,
    Done,
    Aborting,
}

impl PipelineState {
    pub fn name(self) -> &'static str {
        match self {
            PipelineState::Init => "init",
            PipelineState::DeviceAllocated => "device-allocated",
            PipelineState::Partitioned => "partitioned",
            PipelineState::Formatted => "formatted",
            PipelineState::Staged => "staged",
            PipelineState::Unmounted => "unmounted",
            PipelineState::Packaged => "packaged",
            PipelineState::Done => "done",
            PipelineState::Aborting => "aborting",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Aborting)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Forward-only state tracker.
///
/// Families without a block device skip the device states, so an advance
/// may jump ahead but never back. `Aborting` is reachable from every
/// non-terminal state.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: PipelineState,
    history: Vec<PipelineState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self {
            current: PipelineState::Init,
            history: vec![PipelineState::Init],
        }
    }
}

impl StateMachine {
    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn history(&self) -> &[PipelineState] {
        &self.history
    }

    pub fn advance(&mut self, next: PipelineState) -> Result<()> {
        if next == PipelineState::Aborting {
            anyhow::bail!("use abort() to enter the aborting state");
        }
        if self.current.is_terminal() || next <= self.current {
            anyhow::bail!("invalid pipeline transition {} -> {next}", self.current);
        }
        tracing::debug!("pipeline state {} -> {next}", self.current);
        self.enter(next);
        Ok(())
    }

    /// Enter `Aborting`. Returns the state that was interrupted, or `None`
    /// when the machine already finished or is already aborting.
    pub fn abort(&mut self) -> Option<PipelineState> {
        if self.current.is_terminal() {
            return None;
        }
        let interrupted = self.current;
        tracing::warn!("aborting build in state {interrupted}");
        self.enter(PipelineState::Aborting);
        Some(interrupted)
    }

    fn enter(&mut self, state: PipelineState) {
        self.current = state;
        self.history.push(state);
    }
}

/// Shared flag flipped by the signal handler and polled between stages.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
