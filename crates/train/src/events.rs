//! Structured progress events emitted by the training loop.
//!
//! The loop never prints. It hands a [`TrainEvent`] to an [`EventSink`];
//! [`LogReporter`] renders events with [`format_event`] and logs them, tests
//! collect them into a `Vec`.

use std::path::PathBuf;

/// Where the training loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PreContext,
    Forward,
    Backward,
    OptimizerStep,
    Validating,
    Done,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PreContext => "pre-context",
            Self::Forward => "forward",
            Self::Backward => "backward",
            Self::OptimizerStep => "optimizer-step",
            Self::Validating => "validating",
            Self::Done => "done",
        }
    }
}

/// One training iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainIterStats {
    pub epoch: usize,
    pub num_epochs: usize,
    pub iter: usize,
    pub batch_count: usize,
    pub loss: f64,
    /// Moving average over the current epoch's recent iterations.
    pub avg_loss: f64,
    pub lr: f64,
    /// `last` of the pre-context, forward, backward and total timers (seconds).
    pub pre_secs: f64,
    pub fwd_secs: f64,
    pub bck_secs: f64,
    pub tot_secs: f64,
    /// Tokens per second over the epoch's mean iteration time.
    pub tokens_per_sec: f64,
}

/// One validation iteration.
#[derive(Debug, Clone, PartialEq)]
pub struct ValIterStats {
    pub epoch: usize,
    pub num_epochs: usize,
    pub iter: usize,
    pub batch_count: usize,
    pub loss: f64,
    pub fwd_secs: f64,
    pub tot_secs: f64,
    pub tokens_per_sec: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrainEvent {
    ModelBuilt {
        summary: String,
        num_parameters: usize,
    },
    TrainIter(TrainIterStats),
    /// All training batches of `epoch` are done.
    TrainEpoch { epoch: usize, mean_loss: f64 },
    ValIter(ValIterStats),
    /// Validation of `epoch` is done; `history` is the rendered history.
    Validated {
        epoch: usize,
        loss: f64,
        history: String,
    },
    CheckpointSaved { epoch: usize, path: PathBuf },
    /// The loop moved to `Phase`.
    PhaseEntered(Phase),
}

/// Receiver of [`TrainEvent`]s.
pub trait EventSink {
    fn emit(&mut self, event: &TrainEvent);
}

impl<F: FnMut(&TrainEvent)> EventSink for F {
    fn emit(&mut self, event: &TrainEvent) {
        self(event)
    }
}

impl EventSink for Vec<TrainEvent> {
    fn emit(&mut self, event: &TrainEvent) {
        self.push(event.clone());
    }
}

/// Human-readable one-line (or, for history, multi-line) rendering.
pub fn format_event(event: &TrainEvent) -> String {
    match event {
        TrainEvent::ModelBuilt {
            summary,
            num_parameters,
        } => format!("{summary}\nCreated model with {num_parameters} parameters"),
        TrainEvent::TrainIter(s) => format!(
            "ep {}/{} iter {}/{} loss={:.4}, {:.4} lr={:.2e} Times: {:.2} {:.2} {:.2} {:.2} ({:4.1} tps)",
            s.epoch,
            s.num_epochs,
            s.iter,
            s.batch_count,
            s.loss,
            s.avg_loss,
            s.lr,
            s.pre_secs,
            s.fwd_secs,
            s.bck_secs,
            s.tot_secs,
            s.tokens_per_sec
        ),
        TrainEvent::TrainEpoch { mean_loss, .. } => format!("average loss: {mean_loss:.4}"),
        TrainEvent::ValIter(s) => format!(
            "ep {}/{} iter {}/{} loss: {:.4} Time: {:.2} {:.2} ({:4.1} tps)",
            s.epoch,
            s.num_epochs,
            s.iter,
            s.batch_count,
            s.loss,
            s.fwd_secs,
            s.tot_secs,
            s.tokens_per_sec
        ),
        TrainEvent::Validated { history, .. } => history.clone(),
        TrainEvent::CheckpointSaved { epoch, path } => {
            format!("epoch {epoch}: saved checkpoint to {}", path.display())
        }
        TrainEvent::PhaseEntered(phase) => format!("phase: {}", phase.name()),
    }
}

/// Logs events through `tracing`: phase changes at trace level, the rest
/// at info.
#[derive(Debug, Default)]
pub struct LogReporter;

impl EventSink for LogReporter {
    fn emit(&mut self, event: &TrainEvent) {
        match event {
            TrainEvent::PhaseEntered(_) => tracing::trace!("{}", format_event(event)),
            _ => tracing::info!("{}", format_event(event)),
        }
    }
}
