//! # charrnn-train — The Training Loop
//!
//! * **[`TrainingLoop`]** — owns model + optimiser + schedule. One call to
//!   [`TrainingLoop::run`] trains and validates every epoch.
//! * **[`StepLr`]** — learning rate × factor every N epochs.
//! * **[`Timer`]**, **[`Average`]**, **[`ValueHistory`]** — iteration timing
//!   and loss bookkeeping.
//! * **[`TrainEvent`]** / **[`EventSink`]** — structured progress reporting.

pub mod events;
pub mod metrics;
pub mod scheduler;
pub mod timer;
pub mod trainer;

pub use events::{
    format_event, EventSink, LogReporter, Phase, TrainEvent, TrainIterStats, ValIterStats,
};
pub use metrics::{tokens_per_second, Average, ValueHistory};
pub use scheduler::StepLr;
pub use timer::{Timer, TimerScope};
pub use trainer::{flat_cross_entropy, TrainConfig, TrainSummary, TrainingLoop};
