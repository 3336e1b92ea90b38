//! # charrnn-common — Shared Primitives
//!
//! Types and utilities shared across every crate in the workspace:
//!
//! * **[`ModelConfig`]** — model hyper-parameters (serialised as JSON).
//! * **[`TokenVocab`]** — the token ↔ index descriptor.
//! * **[`DataLoader`]** / **[`Batch`]** — split token file and batching.
//! * **[`parse_device`]** — `--device` string → Candle device.

pub mod config;
pub mod data;
pub mod device;
pub mod vocab;

pub use config::{LayerType, ModelConfig};
pub use data::{write_token_file, Batch, DataLoader, Split, SplitBatches, SplitTokens, TokenFile};
pub use device::parse_device;
pub use vocab::TokenVocab;
