//! CLI for training a character-level recurrent language model.
//!
//! Usage: charrnn-train --input_h5 data/corpus.tokens --input_json data/corpus.json [options]
//!
//! Both input files come from `charrnn-preprocess`.

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use charrnn_common::{parse_device, DataLoader, LayerType, ModelConfig, Split, TokenVocab};
use charrnn_core::LanguageModel;
use charrnn_train::{LogReporter, TrainConfig, TrainingLoop};

#[derive(Parser, Debug)]
#[command(name = "charrnn-train", about = "Train a character-level recurrent language model")]
struct Args {
    /// Token file with train/val/test splits.
    #[arg(long = "input_h5", default_value = "data/tiny-shakespeare.tokens")]
    input_h5: PathBuf,

    /// Vocabulary descriptor (idx_to_token / token_to_idx JSON).
    #[arg(long = "input_json", default_value = "data/tiny-shakespeare.json")]
    input_json: PathBuf,

    #[arg(long = "batch_size", default_value = "64")]
    batch_size: usize,

    #[arg(long = "seq_length", default_value = "64")]
    seq_length: usize,

    #[arg(long = "num_epochs", default_value = "50")]
    num_epochs: usize,

    #[arg(long = "num_layers", default_value = "2")]
    num_layers: usize,

    #[arg(long = "embedding_dim", default_value = "128")]
    embedding_dim: usize,

    #[arg(long = "hidden_dim", default_value = "128")]
    hidden_dim: usize,

    /// Probability of keeping each recurrent state element per step.
    #[arg(long = "zoneout", default_value = "0")]
    zoneout: f64,

    #[arg(long = "dropout", default_value = "0")]
    dropout: f64,

    /// Recurrent cell.
    #[arg(long, default_value = "gridgru", value_parser = ["gridgru", "gru", "lstm"])]
    layer_type: String,

    #[arg(long, default_value = "0.002")]
    learning_rate: f64,

    /// Multiply the learning rate by --lrdecay-factor every N epochs (0 = never).
    #[arg(long, default_value = "5")]
    lrdecay_every: usize,

    #[arg(long, default_value = "0.5")]
    lrdecay_factor: f64,

    /// Directory a checkpoint is written to after every epoch.
    #[arg(long, default_value = "models/output")]
    checkpoint: PathBuf,

    /// Don't write checkpoints.
    #[arg(long)]
    no_checkpoint: bool,

    /// Warm-up tokens fed before each sequence (default: seq_length; 0 disables).
    #[arg(long)]
    context_length: Option<usize>,

    /// Seed for the training-batch shuffle.
    #[arg(long, default_value = "0")]
    seed: u64,

    /// cpu, cuda, cuda:N, metal or metal:N.
    #[arg(long, default_value = "cpu")]
    device: String,

    /// Report every N iterations (0 = only epoch summaries).
    #[arg(long, default_value = "1")]
    print_every: usize,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let device = parse_device(&args.device)?;

    tracing::info!("Creating model");
    let vocab = TokenVocab::load(&args.input_json)?;
    tracing::debug!(tokens = vocab.len(), "vocabulary loaded");
    let model_config = ModelConfig {
        vocab_size: vocab.vocab_size(),
        layer_type: args.layer_type.parse::<LayerType>()?,
        num_layers: args.num_layers,
        embedding_dim: args.embedding_dim,
        hidden_dim: args.hidden_dim,
        dropout: args.dropout,
        zoneout: args.zoneout,
    };
    let model = LanguageModel::new(&model_config, &device)?;

    tracing::info!("Loading data");
    let context_length = args.context_length.unwrap_or(args.seq_length);
    let mut loader = DataLoader::open(
        &args.input_h5,
        args.batch_size,
        args.seq_length,
        context_length,
        args.seed,
    )?;
    for split in [Split::Train, Split::Val] {
        tracing::info!(
            split = %split,
            tokens = loader.num_tokens(split),
            batches = loader.batch_count(split),
            "split loaded"
        );
    }

    let checkpoint_dir = (!args.no_checkpoint).then(|| args.checkpoint.clone());
    if let Some(dir) = &checkpoint_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        vocab.save(&dir.join("vocab.json"))?;
    }

    let train_config = TrainConfig {
        num_epochs: args.num_epochs,
        learning_rate: args.learning_rate,
        lrdecay_every: args.lrdecay_every,
        lrdecay_factor: args.lrdecay_factor,
        print_every: args.print_every,
        checkpoint_dir,
    };
    let mut trainer = TrainingLoop::new(model, train_config)?;
    let summary = trainer.run(&mut loader, &mut LogReporter)?;

    if let Some((epoch, loss)) = summary.val_history.best() {
        tracing::info!(epoch, val_loss = loss, final_lr = summary.final_lr, "Training done");
    }
    Ok(())
}
