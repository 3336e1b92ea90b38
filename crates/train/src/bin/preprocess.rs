//! Build the vocabulary and token file `charrnn-train` reads.
//!
//! Usage: charrnn-preprocess --input_txt data/tiny-shakespeare.txt \
//!        --output_h5 data/tiny-shakespeare.tokens --output_json data/tiny-shakespeare.json

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use charrnn_common::{write_token_file, SplitTokens, TokenVocab};

#[derive(Parser)]
#[command(name = "charrnn-preprocess", about = "Encode a text file for charrnn-train")]
struct Args {
    #[arg(long = "input_txt")]
    input_txt: PathBuf,
    #[arg(long = "output_h5")]
    output_h5: PathBuf,
    #[arg(long = "output_json")]
    output_json: PathBuf,
    /// Fraction of the text held out for validation.
    #[arg(long = "val_frac", default_value = "0.1")]
    val_frac: f64,
    /// Fraction of the text held out for testing.
    #[arg(long = "test_frac", default_value = "0.1")]
    test_frac: f64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let text = std::fs::read_to_string(&args.input_txt)
        .with_context(|| format!("read {}", args.input_txt.display()))?;
    let vocab = TokenVocab::from_text(&text);
    let tokens = vocab.encode(&text)?;
    let splits = SplitTokens::from_tokens(tokens, args.val_frac, args.test_frac)?;

    write_token_file(&args.output_h5, &splits)?;
    vocab.save(&args.output_json)?;
    eprintln!(
        "Vocabulary of {} characters; train/val/test = {}/{}/{} tokens",
        vocab.len(),
        splits.train.len(),
        splits.val.len(),
        splits.test.len()
    );
    eprintln!(
        "Train with: --input_h5 {} --input_json {}",
        args.output_h5.display(),
        args.output_json.display()
    );
    Ok(())
}
