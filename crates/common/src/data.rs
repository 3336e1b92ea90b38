//! Data pipeline: token file, splits, batching.
//!
//! * **[`write_token_file`]** / **[`TokenFile`]** — the on-disk token
//!   container, memory-mapped with `memmap2`.
//! * **[`DataLoader`]** — cuts a split into `(batch_size, seq_length)` batches
//!   of next-token prediction data, optionally with a warm-up context.
//!
//! Sequence `j` of a split starts at `context + j * seq_length`; its labels
//! are the same window shifted by one, and its preinputs are the `context`
//! tokens right before it.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context};
use candle_core::{Device, Result, Tensor};
use memmap2::Mmap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

// ── Token file format ────────────────────────────────────────────────────────

/// Magic bytes for the split token format (version 1).
const TOKEN_FILE_MAGIC: &[u8; 4] = b"CTK1";
/// Header size: magic (4) + three split lengths (3 × 8).
const TOKEN_FILE_HEADER_LEN: usize = 4 + 3 * 8;

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Val, Split::Test];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Train => 0,
            Self::Val => 1,
            Self::Test => 2,
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// In-memory token streams for the three splits.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SplitTokens {
    pub train: Vec<u32>,
    pub val: Vec<u32>,
    pub test: Vec<u32>,
}

impl SplitTokens {
    /// Split an encoded corpus: train first, then val, then test.
    pub fn from_tokens(tokens: Vec<u32>, val_frac: f64, test_frac: f64) -> anyhow::Result<Self> {
        if !val_frac.is_finite()
            || !test_frac.is_finite()
            || val_frac < 0.0
            || test_frac < 0.0
            || val_frac + test_frac >= 1.0
        {
            bail!("val_frac ({val_frac}) + test_frac ({test_frac}) must be in [0, 1)");
        }
        let total = tokens.len();
        let num_val = (total as f64 * val_frac) as usize;
        let num_test = (total as f64 * test_frac) as usize;
        let num_train = total - num_val - num_test;
        let mut train = tokens;
        let mut val = train.split_off(num_train);
        let test = val.split_off(num_val);
        Ok(Self { train, val, test })
    }

    pub fn get(&self, split: Split) -> &[u32] {
        match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
            Split::Test => &self.test,
        }
    }
}

/// Write the three splits to a token file for use with [`TokenFile`].
///
/// Format: magic "CTK1" (4 bytes), train/val/test lengths as u64 LE
/// (3 × 8 bytes), then every token as u32 LE, splits in that order.
pub fn write_token_file(path: &Path, splits: &SplitTokens) -> anyhow::Result<()> {
    let file = File::create(path)
        .with_context(|| format!("create token file {}", path.display()))?;
    let mut w = BufWriter::new(file);
    w.write_all(TOKEN_FILE_MAGIC)?;
    for split in Split::ALL {
        w.write_all(&(splits.get(split).len() as u64).to_le_bytes())?;
    }
    for split in Split::ALL {
        for &id in splits.get(split) {
            w.write_all(&id.to_le_bytes())?;
        }
    }
    let file = w.into_inner().context("flush token file")?;
    file.sync_all().context("sync token file")?;
    Ok(())
}

/// Zero-copy view over a token file.
pub struct TokenFile {
    mmap: Mmap,
    /// `(first token, token count)` per split, indexed by [`Split::index`].
    spans: [(usize, usize); 3],
}

impl TokenFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("open token file {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file).context("mmap token file")? };
        if mmap.len() < TOKEN_FILE_HEADER_LEN {
            bail!("token file too short");
        }
        if &mmap[0..4] != TOKEN_FILE_MAGIC {
            bail!("invalid token file: bad magic");
        }
        let mut spans = [(0usize, 0usize); 3];
        let mut first = 0usize;
        for (i, span) in spans.iter_mut().enumerate() {
            let at = 4 + i * 8;
            let mut len = [0u8; 8];
            len.copy_from_slice(&mmap[at..at + 8]);
            let len = usize::try_from(u64::from_le_bytes(len))
                .context("invalid token file: split length overflows")?;
            *span = (first, len);
            first = match first.checked_add(len) {
                Some(n) => n,
                None => bail!("invalid token file: split lengths overflow"),
            };
        }
        let expected_len = match first
            .checked_mul(4)
            .and_then(|n| n.checked_add(TOKEN_FILE_HEADER_LEN))
        {
            Some(n) => n,
            None => bail!("invalid token file: token count {first} overflows"),
        };
        if mmap.len() < expected_len {
            bail!(
                "token file truncated: expected {} bytes, got {}",
                expected_len,
                mmap.len()
            );
        }
        Ok(Self { mmap, spans })
    }

    pub fn split_len(&self, split: Split) -> usize {
        self.spans[split.index()].1
    }

    /// Token `pos` of `split`. `pos` must be below [`split_len`](Self::split_len).
    #[inline]
    fn token(&self, split: Split, pos: usize) -> u32 {
        let i = TOKEN_FILE_HEADER_LEN + (self.spans[split.index()].0 + pos) * 4;
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.mmap[i..i + 4]);
        u32::from_le_bytes(b)
    }

    /// Copy a whole split out of the map.
    pub fn read_split(&self, split: Split) -> Vec<u32> {
        (0..self.split_len(split))
            .map(|pos| self.token(split, pos))
            .collect()
    }
}

// ── Batches ─────────────────────────────────────────────────────────────────

/// One iteration's worth of data. Token vectors are row-major `(batch_size, len)`.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<u32>,
    pub outputs: Vec<u32>,
    pub preinputs: Option<Vec<u32>>,
    pub batch_size: usize,
    pub seq_length: usize,
    pub context_length: usize,
    /// Iteration index within the split.
    pub i: usize,
    pub batch_count: usize,
}

impl Batch {
    pub fn num_tokens(&self) -> usize {
        self.batch_size * self.seq_length
    }

    pub fn input_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.inputs, (self.batch_size, self.seq_length), device)
    }

    pub fn output_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_slice(&self.outputs, (self.batch_size, self.seq_length), device)
    }

    pub fn preinput_tensor(&self, device: &Device) -> Result<Option<Tensor>> {
        self.preinputs
            .as_ref()
            .map(|p| Tensor::from_slice(p, (self.batch_size, self.context_length), device))
            .transpose()
    }
}

/// Lazy, finite sequence of batches for one split.
pub struct SplitBatches<'a> {
    file: &'a TokenFile,
    split: Split,
    order: Vec<usize>,
    batch_size: usize,
    seq_length: usize,
    context_length: usize,
    next: usize,
    batch_count: usize,
}

impl SplitBatches<'_> {
    pub fn batch_count(&self) -> usize {
        self.batch_count
    }

    pub fn split(&self) -> Split {
        self.split
    }
}

impl Iterator for SplitBatches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        if self.next >= self.batch_count {
            return None;
        }
        let (n, t, c) = (self.batch_size, self.seq_length, self.context_length);
        let mut inputs = Vec::with_capacity(n * t);
        let mut outputs = Vec::with_capacity(n * t);
        let mut preinputs = Vec::with_capacity(n * c);
        for &seq in &self.order[self.next * n..(self.next + 1) * n] {
            let start = c + seq * t;
            for pos in start..start + t {
                inputs.push(self.file.token(self.split, pos));
                outputs.push(self.file.token(self.split, pos + 1));
            }
            for pos in start - c..start {
                preinputs.push(self.file.token(self.split, pos));
            }
        }
        let batch = Batch {
            inputs,
            outputs,
            preinputs: (c > 0).then_some(preinputs),
            batch_size: n,
            seq_length: t,
            context_length: c,
            i: self.next,
            batch_count: self.batch_count,
        };
        self.next += 1;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = self.batch_count - self.next;
        (left, Some(left))
    }
}

impl ExactSizeIterator for SplitBatches<'_> {}

/// Produces batches per split. Owns the shuffling RNG, so every shuffled
/// call yields a fresh order.
pub struct DataLoader {
    file: TokenFile,
    batch_size: usize,
    seq_length: usize,
    context_length: usize,
    rng: StdRng,
}

impl DataLoader {
    pub fn open(
        path: &Path,
        batch_size: usize,
        seq_length: usize,
        context_length: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        Self::from_file(TokenFile::open(path)?, batch_size, seq_length, context_length, seed)
    }

    pub fn from_file(
        file: TokenFile,
        batch_size: usize,
        seq_length: usize,
        context_length: usize,
        seed: u64,
    ) -> anyhow::Result<Self> {
        if batch_size == 0 || seq_length == 0 {
            bail!("batch_size ({batch_size}) and seq_length ({seq_length}) must be positive");
        }
        Ok(Self {
            file,
            batch_size,
            seq_length,
            context_length,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn seq_length(&self) -> usize {
        self.seq_length
    }

    pub fn context_length(&self) -> usize {
        self.context_length
    }

    pub fn num_tokens(&self, split: Split) -> usize {
        self.file.split_len(split)
    }

    /// Full sequences available in `split` (each needs one extra label token).
    pub fn num_sequences(&self, split: Split) -> usize {
        self.file
            .split_len(split)
            .saturating_sub(1 + self.context_length)
            / self.seq_length
    }

    pub fn batch_count(&self, split: Split) -> usize {
        self.num_sequences(split) / self.batch_size
    }

    /// Batches for `split`; `shuffle` permutes the sequence order.
    pub fn make_batches(&mut self, split: Split, shuffle: bool) -> anyhow::Result<SplitBatches<'_>> {
        let batch_count = self.batch_count(split);
        if batch_count == 0 {
            bail!(
                "{split} split has {} tokens, too few for one batch of {}x{} (context {})",
                self.file.split_len(split),
                self.batch_size,
                self.seq_length,
                self.context_length
            );
        }
        let mut order: Vec<usize> = (0..self.num_sequences(split)).collect();
        if shuffle {
            order.shuffle(&mut self.rng);
        }
        Ok(SplitBatches {
            file: &self.file,
            split,
            order,
            batch_size: self.batch_size,
            seq_length: self.seq_length,
            context_length: self.context_length,
            next: 0,
            batch_count,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
