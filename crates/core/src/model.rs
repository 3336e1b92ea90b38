//! Character-level recurrent language model.
//!
//! `embedding → [recurrent layer → dropout] × L → linear → logits`
//!
//! Recurrent state is an explicit [`HiddenState`] value: every forward call
//! takes the state to start from and returns the state it ended in.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{embedding, linear, Embedding, Linear, Module, VarBuilder, VarMap};

use charrnn_common::ModelConfig;

use crate::cell::{LayerState, RecurrentLayer};
use crate::regularize::{dropout, Mode};

/// Per-layer recurrent state for one batch.
#[derive(Debug, Clone)]
pub struct HiddenState {
    layers: Vec<LayerState>,
}

impl HiddenState {
    pub fn batch_size(&self) -> usize {
        self.layers.first().map_or(0, |l| l.h.dims()[0])
    }

    pub fn layers(&self) -> &[LayerState] {
        &self.layers
    }

    /// Cut the autograd graph: gradients of later losses stop here.
    pub fn detach(&self) -> Self {
        Self {
            layers: self.layers.iter().map(LayerState::detach).collect(),
        }
    }
}

/// Recurrent language model. Owns its parameters.
pub struct LanguageModel {
    varmap: VarMap,
    wte: Embedding,
    layers: Vec<RecurrentLayer>,
    head: Linear,
    config: ModelConfig,
    mode: Mode,
    device: Device,
}

impl LanguageModel {
    /// Build a freshly initialised model on `device`.
    pub fn new(config: &ModelConfig, device: &Device) -> anyhow::Result<Self> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let wte = embedding(config.vocab_size, config.embedding_dim, vb.pp("wte"))?;

        let mut layers = Vec::with_capacity(config.num_layers);
        let mut input_dim = config.embedding_dim;
        for i in 0..config.num_layers {
            layers.push(RecurrentLayer::new(
                input_dim,
                config,
                vb.pp(format!("layers.{i}")),
            )?);
            input_dim = config.layer_output_dim();
        }
        let head = linear(input_dim, config.vocab_size, vb.pp("head"))?;

        Ok(Self {
            varmap,
            wte,
            layers,
            head,
            config: config.clone(),
            mode: Mode::Train,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Enable dropout and stochastic zoneout.
    pub fn train(&mut self) {
        self.mode = Mode::Train;
    }

    /// Disable stochastic regularisation.
    pub fn eval(&mut self) {
        self.mode = Mode::Eval;
    }

    /// All trainable variables, for optimiser registration.
    pub fn parameters(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.parameters().iter().map(|v| v.elem_count()).sum()
    }

    /// Fresh all-zero state for a batch of `batch_size` sequences.
    pub fn zero_state(&self, batch_size: usize) -> Result<HiddenState> {
        let like = self.wte.embeddings();
        let layers = self
            .layers
            .iter()
            .map(|l| l.zero_state(batch_size, like))
            .collect::<Result<Vec<_>>>()?;
        Ok(HiddenState { layers })
    }

    /// Forward over `input_ids: (N, T)` from `state`.
    ///
    /// Returns logits `(N, T, V)` and the state after the last timestep.
    pub fn forward(&self, input_ids: &Tensor, state: &HiddenState) -> Result<(Tensor, HiddenState)> {
        let (n, _t) = input_ids.dims2()?;
        if state.layers.len() != self.layers.len() || state.batch_size() != n {
            candle_core::bail!(
                "hidden state ({} layers, batch {}) does not match model ({} layers) and input batch {}",
                state.layers.len(),
                state.batch_size(),
                self.layers.len(),
                n
            );
        }
        let mut x = self.wte.forward(input_ids)?;
        let mut next = Vec::with_capacity(self.layers.len());
        for (layer, layer_state) in self.layers.iter().zip(&state.layers) {
            let (out, s) = layer.forward(&x, layer_state, self.mode)?;
            x = dropout(&out, self.config.dropout, self.mode)?;
            next.push(s);
        }
        let logits = self.head.forward(&x)?;
        Ok((logits, HiddenState { layers: next }))
    }

    /// Write `model.safetensors` and `config.json` into `dir`.
    pub fn save(&self, dir: &Path) -> anyhow::Result<PathBuf> {
        self.save_as(dir, "model.safetensors")
    }

    /// Write weights under `file_name` plus `config.json` into `dir`.
    pub fn save_as(&self, dir: &Path, file_name: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create checkpoint dir {}", dir.display()))?;
        let path = dir.join(file_name);
        self.varmap
            .save(&path)
            .with_context(|| format!("save weights {}", path.display()))?;
        self.config.save(&dir.join("config.json"))?;
        Ok(path)
    }

    /// Overwrite the parameters from a safetensors file written by [`save`](Self::save).
    pub fn load_weights(&mut self, path: &Path) -> anyhow::Result<()> {
        self.varmap
            .load(path)
            .with_context(|| format!("load weights {}", path.display()))?;
        Ok(())
    }
}

impl fmt::Display for LanguageModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = &self.config;
        writeln!(f, "Embedding({}, {})", c.vocab_size, c.embedding_dim)?;
        let mut input_dim = c.embedding_dim;
        for i in 0..c.num_layers {
            writeln!(
                f,
                "  ({i}) {}(input={}, hidden={}, zoneout={}, dropout={})",
                c.layer_type, input_dim, c.hidden_dim, c.zoneout, c.dropout
            )?;
            input_dim = c.layer_output_dim();
        }
        write!(f, "Linear({}, {})", input_dim, c.vocab_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use charrnn_common::LayerType;

    fn config(layer_type: LayerType) -> ModelConfig {
        ModelConfig {
            vocab_size: 11,
            layer_type,
            num_layers: 2,
            embedding_dim: 6,
            hidden_dim: 8,
            ..Default::default()
        }
    }

    fn ids(rows: &[[u32; 4]]) -> Tensor {
        let flat: Vec<u32> = rows.iter().flatten().copied().collect();
        Tensor::from_vec(flat, (rows.len(), 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn logits_shape_for_every_layer_type() {
        for kind in [LayerType::Gru, LayerType::Lstm, LayerType::GridGru] {
            let model = LanguageModel::new(&config(kind), &Device::Cpu).unwrap();
            let state = model.zero_state(2).unwrap();
            let (logits, next) = model.forward(&ids(&[[1, 2, 3, 4], [5, 6, 7, 8]]), &state).unwrap();
            assert_eq!(logits.dims(), &[2, 4, 11]);
            assert_eq!(next.layers().len(), 2);
            assert_eq!(next.batch_size(), 2);
        }
    }

    #[test]
    fn parameter_count_matches_architecture() {
        let model = LanguageModel::new(&config(LayerType::Gru), &Device::Cpu).unwrap();
        let (v, d, h) = (11, 6, 8);
        let gru = |input: usize| input * 3 * h + 3 * h + h * 2 * h + h * h;
        let expected = v * d + gru(d) + gru(h) + h * v + v;
        assert_eq!(model.num_parameters(), expected);
    }

    #[test]
    fn fresh_state_forgets_previous_batches() {
        let mut model = LanguageModel::new(&config(LayerType::GridGru), &Device::Cpu).unwrap();
        model.eval();
        let a = ids(&[[1, 2, 3, 4]]);
        let b = ids(&[[9, 8, 7, 6]]);

        let (alone, _) = model.forward(&b, &model.zero_state(1).unwrap()).unwrap();
        let (_, after_a) = model.forward(&a, &model.zero_state(1).unwrap()).unwrap();
        let (fresh, _) = model.forward(&b, &model.zero_state(1).unwrap()).unwrap();
        let (carried, _) = model.forward(&b, &after_a).unwrap();

        let diff = |x: &Tensor, y: &Tensor| -> f32 {
            (x - y).unwrap().abs().unwrap().max_all().unwrap().to_scalar().unwrap()
        };
        assert_eq!(diff(&alone, &fresh), 0.0);
        assert!(diff(&alone, &carried) > 0.0);
    }

    #[test]
    fn mode_switches_dropout() {
        let mut model = LanguageModel::new(
            &ModelConfig {
                dropout: 0.5,
                ..config(LayerType::Gru)
            },
            &Device::Cpu,
        )
        .unwrap();
        let x = ids(&[[1, 2, 3, 4], [5, 6, 7, 8]]);
        let run = |model: &LanguageModel| -> Vec<f32> {
            let (logits, _) = model.forward(&x, &model.zero_state(2).unwrap()).unwrap();
            logits.flatten_all().unwrap().to_vec1().unwrap()
        };

        assert_eq!(model.mode(), Mode::Train);
        assert_ne!(run(&model), run(&model));

        model.eval();
        assert_eq!(run(&model), run(&model));

        model.train();
        assert_ne!(run(&model), run(&model));
    }

    #[test]
    fn detached_warm_up_gets_no_gradient() {
        let model = LanguageModel::new(&config(LayerType::Gru), &Device::Cpu).unwrap();
        let pre = ids(&[[1, 2, 3, 4]]);
        let x = ids(&[[5, 5, 5, 5]]);
        let y = ids(&[[6, 6, 6, 6]]);

        let (_, warm) = model.forward(&pre, &model.zero_state(1).unwrap()).unwrap();
        let (logits, _) = model.forward(&x, &warm.detach()).unwrap();
        let loss = candle_nn::loss::cross_entropy(
            &logits.reshape((4, 11)).unwrap(),
            &y.reshape(4).unwrap(),
        )
        .unwrap();
        let grads = loss.backward().unwrap();

        let g = grads.get(model.wte.embeddings()).unwrap();
        let rows: Vec<f32> = g.abs().unwrap().sum(1).unwrap().to_vec1().unwrap();
        for token in 1..=4 {
            assert_eq!(rows[token], 0.0, "warm-up token {token}");
        }
        assert!(rows[5] > 0.0);
    }

    #[test]
    fn state_batch_mismatch_is_an_error() {
        let model = LanguageModel::new(&config(LayerType::Lstm), &Device::Cpu).unwrap();
        let state = model.zero_state(3).unwrap();
        assert!(model.forward(&ids(&[[1, 2, 3, 4]]), &state).is_err());
    }

    #[test]
    fn invalid_config_is_rejected() {
        let bad = ModelConfig {
            num_layers: 0,
            ..config(LayerType::Gru)
        };
        assert!(LanguageModel::new(&bad, &Device::Cpu).is_err());
    }

    #[test]
    fn save_and_reload_weights() {
        let dir = tempfile::tempdir().unwrap();
        let mut model = LanguageModel::new(&config(LayerType::Gru), &Device::Cpu).unwrap();
        model.eval();
        let path = model.save(dir.path()).unwrap();
        assert!(dir.path().join("config.json").exists());

        let mut other = LanguageModel::new(&config(LayerType::Gru), &Device::Cpu).unwrap();
        other.eval();
        other.load_weights(&path).unwrap();
        let x = ids(&[[1, 2, 3, 4]]);
        let (a, _) = model.forward(&x, &model.zero_state(1).unwrap()).unwrap();
        let (b, _) = other.forward(&x, &other.zero_state(1).unwrap()).unwrap();
        let a: Vec<f32> = a.flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = b.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn display_lists_layers() {
        let model = LanguageModel::new(&config(LayerType::GridGru), &Device::Cpu).unwrap();
        let text = model.to_string();
        assert!(text.contains("(1) gridgru(input=6, hidden=8"));
        assert!(text.ends_with("Linear(6, 11)"));
    }
}
