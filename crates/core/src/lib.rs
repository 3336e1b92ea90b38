//! # charrnn-core — The Model
//!
//! Every compute primitive needed to build and run the character-level
//! recurrent language model:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`regularize`] | [`Mode`], zoneout, dropout |
//! | [`cell`] | GRU / LSTM / GridGRU cells, [`RecurrentLayer`] |
//! | [`model`] | [`LanguageModel`], [`HiddenState`] |
//!
//! Everything goes through `candle-core`/`candle-nn`, so the same code runs
//! on CPU, CUDA and Metal.

pub mod cell;
pub mod model;
pub mod regularize;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use cell::{LayerState, RecurrentLayer};
pub use model::{HiddenState, LanguageModel};
pub use regularize::Mode;
