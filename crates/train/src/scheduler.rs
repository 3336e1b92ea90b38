//! Epoch-indexed learning-rate schedule.

// ── Step LR ─────────────────────────────────────────────────────────────────

/// Step decay: multiply the learning rate by `factor` every `every` epochs,
/// regardless of how the loss moves.
///
/// ```text
/// lr(k) = lr0 · factor^⌊k / every⌋
/// ```
#[derive(Debug, Clone)]
pub struct StepLr {
    epoch: usize,
    lr: f64,
    every: usize,
    factor: f64,
}

impl StepLr {
    /// `every == 0` disables decay.
    pub fn new(lr: f64, every: usize, factor: f64) -> Self {
        Self {
            epoch: 0,
            lr,
            every,
            factor,
        }
    }

    /// Learning rate after `epoch` completed epochs.
    pub fn lr_at(&self, epoch: usize) -> f64 {
        if self.every == 0 {
            return self.lr;
        }
        let drops = (epoch / self.every) as i32;
        self.lr * self.factor.powi(drops)
    }

    /// Learning rate for the current epoch.
    pub fn current_lr(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    /// Advance one epoch.
    pub fn step(&mut self) {
        self.epoch += 1;
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
