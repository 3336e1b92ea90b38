//! Trainer: the epoch loop.
//!
//! Per epoch: train over shuffled batches (fresh state, optional warm-up,
//! forward, backward, Adam step), validate over sequential batches, record
//! the validation loss, optionally checkpoint, then advance the step LR
//! schedule.

use std::path::PathBuf;

use anyhow::{bail, Context};
use candle_core::{DType, Tensor};
use candle_nn::{loss, AdamW, Optimizer, ParamsAdamW};

use charrnn_common::{Batch, DataLoader, Split};
use charrnn_core::{HiddenState, LanguageModel};

use crate::events::{EventSink, Phase, TrainEvent, TrainIterStats, ValIterStats};
use crate::metrics::{tokens_per_second, Average, ValueHistory};
use crate::scheduler::StepLr;
use crate::timer::Timer;

/// Iterations kept by the moving training-loss average.
const LOSS_WINDOW: usize = 100;

// ── Config ──────────────────────────────────────────────────────────────────

/// Loop hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub num_epochs: usize,
    pub learning_rate: f64,
    /// Epochs between learning-rate drops (0 = never).
    pub lrdecay_every: usize,
    pub lrdecay_factor: f64,
    /// Emit an iteration event when `i % print_every == 0` (0 = never).
    pub print_every: usize,
    /// Directory for per-epoch checkpoints (None = don't save).
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_epochs: 50,
            learning_rate: 2e-3,
            lrdecay_every: 5,
            lrdecay_factor: 0.5,
            print_every: 1,
            checkpoint_dir: None,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.learning_rate > 0.0) {
            bail!("learning rate must be positive, got {}", self.learning_rate);
        }
        if !(self.lrdecay_factor > 0.0) {
            bail!("lrdecay factor must be positive, got {}", self.lrdecay_factor);
        }
        Ok(())
    }
}

/// Result of a full run.
#[derive(Debug, Clone)]
pub struct TrainSummary {
    /// Mean training loss per epoch.
    pub train_losses: Vec<f64>,
    pub val_history: ValueHistory,
    /// Learning rate the next epoch would use.
    pub final_lr: f64,
}

#[derive(Default)]
struct Timers {
    pre: Timer,
    fwd: Timer,
    bck: Timer,
    tot: Timer,
}

impl Timers {
    fn reset(&self) {
        self.pre.reset();
        self.fwd.reset();
        self.bck.reset();
        self.tot.reset();
    }
}

// ── TrainingLoop ────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimiser, schedule and metrics.
pub struct TrainingLoop {
    model: LanguageModel,
    optimizer: AdamW,
    scheduler: StepLr,
    config: TrainConfig,
    timers: Timers,
    avg_loss: Average,
    val_history: ValueHistory,
    train_losses: Vec<f64>,
    phase: Phase,
}

impl TrainingLoop {
    pub fn new(model: LanguageModel, config: TrainConfig) -> anyhow::Result<Self> {
        config.validate()?;
        // Plain Adam: AdamW without weight decay.
        let optimizer = AdamW::new(
            model.parameters(),
            ParamsAdamW {
                lr: config.learning_rate,
                weight_decay: 0.0,
                ..Default::default()
            },
        )?;
        let scheduler = StepLr::new(
            config.learning_rate,
            config.lrdecay_every,
            config.lrdecay_factor,
        );
        Ok(Self {
            model,
            optimizer,
            scheduler,
            config,
            timers: Timers::default(),
            avg_loss: Average::new(LOSS_WINDOW),
            val_history: ValueHistory::new("val loss"),
            train_losses: Vec::new(),
            phase: Phase::Idle,
        })
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Run every configured epoch.
    pub fn run(
        &mut self,
        loader: &mut DataLoader,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<TrainSummary> {
        // Fail before the first step rather than after a full epoch.
        for split in [Split::Train, Split::Val] {
            if loader.batch_count(split) == 0 {
                bail!(
                    "{split} split ({} tokens) is too small for one batch",
                    loader.num_tokens(split)
                );
            }
        }
        sink.emit(&TrainEvent::ModelBuilt {
            summary: self.model.to_string(),
            num_parameters: self.model.num_parameters(),
        });
        for epoch in 0..self.config.num_epochs {
            self.run_epoch(epoch, loader, sink)?;
        }
        self.enter(Phase::Done, sink);
        Ok(TrainSummary {
            train_losses: self.train_losses.clone(),
            val_history: self.val_history.clone(),
            final_lr: self.scheduler.current_lr(),
        })
    }

    /// Train, validate, checkpoint and advance the schedule for one epoch.
    pub fn run_epoch(
        &mut self,
        epoch: usize,
        loader: &mut DataLoader,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<()> {
        self.optimizer.set_learning_rate(self.scheduler.current_lr());

        let mean_loss = self.train_epoch(epoch, loader, sink)?;
        self.train_losses.push(mean_loss);
        sink.emit(&TrainEvent::TrainEpoch { epoch, mean_loss });

        let val_loss = self.validate(epoch, loader, sink)?;
        self.val_history.add_value(epoch, val_loss)?;
        sink.emit(&TrainEvent::Validated {
            epoch,
            loss: val_loss,
            history: self.val_history.format(),
        });

        if let Some(dir) = &self.config.checkpoint_dir {
            let path = self
                .model
                .save_as(dir, &format!("checkpoint-{epoch}.safetensors"))?;
            tracing::debug!(path = %path.display(), "checkpoint written");
            sink.emit(&TrainEvent::CheckpointSaved { epoch, path });
        }

        self.scheduler.step();
        self.enter(Phase::Idle, sink);
        Ok(())
    }

    /// One pass over the shuffled training split; returns the mean loss.
    fn train_epoch(
        &mut self,
        epoch: usize,
        loader: &mut DataLoader,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<f64> {
        self.timers.reset();
        self.avg_loss.reset();
        let mut total_loss = 0.0f64;
        self.model.train();

        let batches = loader.make_batches(Split::Train, true)?;
        let batch_count = batches.batch_count();
        for batch in batches {
            self.timers.tot.start();
            let loss = self.train_step(&batch, sink)?;
            self.timers.tot.stop();
            if !loss.is_finite() {
                bail!("epoch {epoch} iter {}: training loss is {loss}", batch.i);
            }

            total_loss += loss;
            self.avg_loss.add_value(loss);
            if self.should_print(batch.i) {
                sink.emit(&TrainEvent::TrainIter(TrainIterStats {
                    epoch,
                    num_epochs: self.config.num_epochs,
                    iter: batch.i,
                    batch_count,
                    loss,
                    avg_loss: self.avg_loss.avg(),
                    lr: self.optimizer.learning_rate(),
                    pre_secs: self.timers.pre.last(),
                    fwd_secs: self.timers.fwd.last(),
                    bck_secs: self.timers.bck.last(),
                    tot_secs: self.timers.tot.last(),
                    tokens_per_sec: tokens_per_second(
                        batch.batch_size,
                        batch.seq_length,
                        self.timers.tot.average(),
                    ),
                }));
            }
        }
        Ok(total_loss / batch_count as f64)
    }

    /// Warm-up, forward, backward and optimiser step for one batch.
    fn train_step(&mut self, batch: &Batch, sink: &mut dyn EventSink) -> anyhow::Result<f64> {
        let device = self.model.device().clone();
        let mut state = self.model.zero_state(batch.batch_size)?;

        if let Some(pre) = batch.preinput_tensor(&device)? {
            self.enter(Phase::PreContext, sink);
            let _t = self.timers.pre.scope();
            state = self.warm_up(&pre, &state)?;
        }

        self.enter(Phase::Forward, sink);
        let loss = {
            let _t = self.timers.fwd.scope();
            let (logits, _) = self.model.forward(&batch.input_tensor(&device)?, &state)?;
            flat_cross_entropy(&logits, &batch.output_tensor(&device)?)?
        };

        self.enter(Phase::Backward, sink);
        let grads = {
            let _t = self.timers.bck.scope();
            loss.backward()?
        };

        self.enter(Phase::OptimizerStep, sink);
        self.optimizer.step(&grads)?;

        Ok(loss.to_scalar::<f32>()? as f64)
    }

    /// Sequential pass over the validation split; returns the mean loss.
    fn validate(
        &mut self,
        epoch: usize,
        loader: &mut DataLoader,
        sink: &mut dyn EventSink,
    ) -> anyhow::Result<f64> {
        self.enter(Phase::Validating, sink);
        self.model.eval();
        self.timers.tot.reset();
        self.timers.fwd.reset();
        let device = self.model.device().clone();
        let mut total_loss = 0.0f64;

        let batches = loader.make_batches(Split::Val, false)?;
        let batch_count = batches.batch_count();
        for batch in batches {
            self.timers.tot.start();
            let mut state = self.model.zero_state(batch.batch_size)?;
            if let Some(pre) = batch.preinput_tensor(&device)? {
                state = self.warm_up(&pre, &state)?;
            }
            let logits = {
                let _t = self.timers.fwd.scope();
                self.model.forward(&batch.input_tensor(&device)?, &state)?.0
            };
            let loss = flat_cross_entropy(&logits, &batch.output_tensor(&device)?)?
                .to_scalar::<f32>()? as f64;
            self.timers.tot.stop();
            total_loss += loss;

            if self.should_print(batch.i) {
                sink.emit(&TrainEvent::ValIter(ValIterStats {
                    epoch,
                    num_epochs: self.config.num_epochs,
                    iter: batch.i,
                    batch_count,
                    loss,
                    fwd_secs: self.timers.fwd.last(),
                    tot_secs: self.timers.tot.last(),
                    tokens_per_sec: tokens_per_second(
                        batch.batch_size,
                        batch.seq_length,
                        self.timers.tot.last(),
                    ),
                }));
            }
        }
        Ok(total_loss / batch_count as f64)
    }

    /// Prime the state on context tokens; the result carries no gradient.
    fn warm_up(&self, preinputs: &Tensor, state: &HiddenState) -> anyhow::Result<HiddenState> {
        let (_, state) = self
            .model
            .forward(preinputs, state)
            .context("warm-up forward")?;
        Ok(state.detach())
    }

    fn enter(&mut self, phase: Phase, sink: &mut dyn EventSink) {
        self.phase = phase;
        sink.emit(&TrainEvent::PhaseEntered(phase));
    }

    fn should_print(&self, iter: usize) -> bool {
        self.config.print_every > 0 && iter % self.config.print_every == 0
    }
}

// ── Loss ────────────────────────────────────────────────────────────────────

/// Cross-entropy over `(N, T, V)` logits and `(N, T)` targets, with batch
/// and time flattened into one axis.
pub fn flat_cross_entropy(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let (n, t, v) = logits.dims3()?;
    let logits_flat = logits.reshape((n * t, v))?;
    let targets_flat = targets.reshape((n * t,))?.to_dtype(DType::U32)?;
    loss::cross_entropy(&logits_flat, &targets_flat)
}

// ── Tests ───────────────────────────────────────────────────────────────────
