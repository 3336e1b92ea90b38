//! Recurrent layers: GRU, LSTM and GridGRU.
//!
//! | Cell | State | Output width |
//! |------|-------|--------------|
//! | GRU | `h` (H) | H |
//! | LSTM | `h`, `c` (H) | H |
//! | GridGRU | `h` (H) | D — a depth GRU refines the input with the new `h` |
//!
//! Input projections are computed once for the whole `(N, T, D_in)` block;
//! only the recurrent matmuls run per timestep.

use candle_core::{Result, Tensor, D};
use candle_nn::{linear, linear_no_bias, Linear, Module, VarBuilder};

use charrnn_common::{LayerType, ModelConfig};

use crate::regularize::{zoneout, Mode};

/// Recurrent state carried between timesteps for one layer.
#[derive(Debug, Clone)]
pub struct LayerState {
    pub h: Tensor,
    /// Cell memory; only LSTM layers have one.
    pub c: Option<Tensor>,
}

impl LayerState {
    pub fn detach(&self) -> Self {
        Self {
            h: self.h.detach(),
            c: self.c.as_ref().map(Tensor::detach),
        }
    }
}

// ── GRU ─────────────────────────────────────────────────────────────────────

/// ```text
/// u  = σ(Wx_u x + Wh_u h)
/// r  = σ(Wx_r x + Wh_r h)
/// h̃  = tanh(Wx_c x + Wh_c (r ⊙ h))
/// h' = u ⊙ h + (1 - u) ⊙ h̃
/// ```
struct GruCell {
    w_x: Linear,
    w_h_gates: Linear,
    w_h_cand: Linear,
}

impl GruCell {
    fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_x: linear(input_dim, 3 * hidden_dim, vb.pp("w_x"))?,
            w_h_gates: linear_no_bias(hidden_dim, 2 * hidden_dim, vb.pp("w_h_gates"))?,
            w_h_cand: linear_no_bias(hidden_dim, hidden_dim, vb.pp("w_h_cand"))?,
        })
    }

    /// Input projection for any leading shape: `(.., D_in) → (.., 3H)`.
    fn project(&self, x: &Tensor) -> Result<Tensor> {
        self.w_x.forward(x)
    }

    /// One step from a projected input `gx: (N, 3H)`.
    fn step(&self, gx: &Tensor, h: &Tensor) -> Result<Tensor> {
        let gx = gx.chunk(3, D::Minus1)?;
        let gh = self.w_h_gates.forward(h)?.chunk(2, D::Minus1)?;
        let u = candle_nn::ops::sigmoid(&(&gx[0] + &gh[0])?)?;
        let r = candle_nn::ops::sigmoid(&(&gx[1] + &gh[1])?)?;
        let cand = (&gx[2] + self.w_h_cand.forward(&(&r * h)?)?)?.tanh()?;
        (&u * h)? + (u.affine(-1.0, 1.0)? * cand)?
    }
}

// ── LSTM ────────────────────────────────────────────────────────────────────

struct LstmCell {
    w_x: Linear,
    w_h: Linear,
}

impl LstmCell {
    fn new(input_dim: usize, hidden_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            w_x: linear(input_dim, 4 * hidden_dim, vb.pp("w_x"))?,
            w_h: linear_no_bias(hidden_dim, 4 * hidden_dim, vb.pp("w_h"))?,
        })
    }

    /// One step from a projected input `gx: (N, 4H)`; returns `(h', c')`.
    fn step(&self, gx: &Tensor, h: &Tensor, c: &Tensor) -> Result<(Tensor, Tensor)> {
        let gates = (gx + self.w_h.forward(h)?)?.chunk(4, D::Minus1)?;
        let i = candle_nn::ops::sigmoid(&gates[0])?;
        let f = candle_nn::ops::sigmoid(&gates[1])?;
        let o = candle_nn::ops::sigmoid(&gates[2])?;
        let g = gates[3].tanh()?;
        let c = ((f * c)? + (i * g)?)?;
        let h = (o * c.tanh()?)?;
        Ok((h, c))
    }
}

// ── Layer ───────────────────────────────────────────────────────────────────

enum Cell {
    Gru(GruCell),
    Lstm(LstmCell),
    /// Temporal GRU over `h` fed by the input, then a depth GRU over the
    /// input fed by the new `h`.
    GridGru { time: GruCell, depth: GruCell },
}

/// One recurrent layer of the stack.
pub struct RecurrentLayer {
    cell: Cell,
    hidden_dim: usize,
    zoneout: f64,
}

impl RecurrentLayer {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("layers.0")`).
    pub fn new(input_dim: usize, config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let h = config.hidden_dim;
        let cell = match config.layer_type {
            LayerType::Gru => Cell::Gru(GruCell::new(input_dim, h, vb)?),
            LayerType::Lstm => Cell::Lstm(LstmCell::new(input_dim, h, vb)?),
            LayerType::GridGru => Cell::GridGru {
                time: GruCell::new(input_dim, h, vb.pp("time"))?,
                depth: GruCell::new(h, input_dim, vb.pp("depth"))?,
            },
        };
        Ok(Self {
            cell,
            hidden_dim: h,
            zoneout: config.zoneout,
        })
    }

    pub fn zero_state(&self, batch_size: usize, like: &Tensor) -> Result<LayerState> {
        let h = Tensor::zeros((batch_size, self.hidden_dim), like.dtype(), like.device())?;
        let c = match self.cell {
            Cell::Lstm(_) => Some(h.zeros_like()?),
            _ => None,
        };
        Ok(LayerState { h, c })
    }

    /// Run the layer over `x: (N, T, D_in)` starting from `state`.
    /// Returns the per-step outputs `(N, T, D_out)` and the final state.
    pub fn forward(&self, x: &Tensor, state: &LayerState, mode: Mode) -> Result<(Tensor, LayerState)> {
        let (_n, t, _) = x.dims3()?;
        let mut h = state.h.clone();
        let mut c = state.c.clone();
        let mut outputs = Vec::with_capacity(t);
        match &self.cell {
            Cell::Gru(cell) => {
                let gx = cell.project(x)?;
                for step in 0..t {
                    let gx_t = gx.narrow(1, step, 1)?.squeeze(1)?;
                    let next = cell.step(&gx_t, &h)?;
                    h = zoneout(&h, &next, self.zoneout, mode)?;
                    outputs.push(h.clone());
                }
            }
            Cell::Lstm(cell) => {
                let gx = cell.w_x.forward(x)?;
                let mut mem = match c.take() {
                    Some(mem) => mem,
                    None => candle_core::bail!("LSTM layer requires a cell state"),
                };
                for step in 0..t {
                    let gx_t = gx.narrow(1, step, 1)?.squeeze(1)?;
                    let (next_h, next_c) = cell.step(&gx_t, &h, &mem)?;
                    h = zoneout(&h, &next_h, self.zoneout, mode)?;
                    mem = zoneout(&mem, &next_c, self.zoneout, mode)?;
                    outputs.push(h.clone());
                }
                c = Some(mem);
            }
            Cell::GridGru { time, depth } => {
                let gx = time.project(x)?;
                for step in 0..t {
                    let x_t = x.narrow(1, step, 1)?.squeeze(1)?;
                    let gx_t = gx.narrow(1, step, 1)?.squeeze(1)?;
                    let next = time.step(&gx_t, &h)?;
                    h = zoneout(&h, &next, self.zoneout, mode)?;
                    outputs.push(depth.step(&depth.project(&h)?, &x_t)?);
                }
            }
        }
        Ok((Tensor::stack(&outputs, 1)?, LayerState { h, c }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn layer(layer_type: LayerType) -> (VarMap, RecurrentLayer) {
        let config = ModelConfig {
            vocab_size: 8,
            layer_type,
            embedding_dim: 6,
            hidden_dim: 5,
            ..Default::default()
        };
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = RecurrentLayer::new(6, &config, vb).unwrap();
        (varmap, layer)
    }

    #[test]
    fn output_shapes_per_cell() {
        let x = Tensor::randn(0f32, 1f32, (3, 4, 6), &Device::Cpu).unwrap();
        for (kind, width) in [
            (LayerType::Gru, 5),
            (LayerType::Lstm, 5),
            (LayerType::GridGru, 6),
        ] {
            let (_vm, layer) = layer(kind);
            let state = layer.zero_state(3, &x).unwrap();
            let (out, next) = layer.forward(&x, &state, Mode::Eval).unwrap();
            assert_eq!(out.dims(), &[3, 4, width], "{kind}");
            assert_eq!(next.h.dims(), &[3, 5]);
            assert_eq!(next.c.is_some(), kind == LayerType::Lstm);
        }
    }

    #[test]
    fn gru_output_stays_in_tanh_range() {
        let (_vm, layer) = layer(LayerType::Gru);
        let x = Tensor::randn(0f32, 3f32, (2, 10, 6), &Device::Cpu).unwrap();
        let state = layer.zero_state(2, &x).unwrap();
        let (out, _) = layer.forward(&x, &state, Mode::Eval).unwrap();
        let max = out.abs().unwrap().max_all().unwrap().to_scalar::<f32>().unwrap();
        assert!(max <= 1.0);
    }

    #[test]
    fn lstm_without_cell_state_fails() {
        let (_vm, layer) = layer(LayerType::Lstm);
        let x = Tensor::zeros((1, 2, 6), DType::F32, &Device::Cpu).unwrap();
        let mut state = layer.zero_state(1, &x).unwrap();
        state.c = None;
        assert!(layer.forward(&x, &state, Mode::Eval).is_err());
    }
}
