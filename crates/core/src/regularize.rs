//! Stochastic regularisation: zoneout on recurrent state, dropout on layer
//! outputs. Both are switched by [`Mode`].

use candle_core::{Result, Tensor};
use candle_nn::ops;

/// Whether stochastic regularisation is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    #[default]
    Train,
    Eval,
}

/// Zoneout: keep each element of `prev` with probability `p`, otherwise take
/// `next`.
///
/// In [`Mode::Eval`] the expectation `p·prev + (1-p)·next` is used, so
/// evaluation is deterministic.
pub fn zoneout(prev: &Tensor, next: &Tensor, p: f64, mode: Mode) -> Result<Tensor> {
    if p <= 0.0 {
        return Ok(next.clone());
    }
    match mode {
        Mode::Train => {
            let keep = Tensor::rand(0f32, 1f32, prev.shape(), prev.device())?
                .lt(p as f32)?
                .to_dtype(prev.dtype())?;
            let update = keep.affine(-1.0, 1.0)?;
            (prev * &keep)? + (next * &update)?
        }
        Mode::Eval => prev.affine(p, 0.0)? + next.affine(1.0 - p, 0.0)?,
    }
}

/// Inverted dropout while training; identity in eval.
pub fn dropout(x: &Tensor, p: f64, mode: Mode) -> Result<Tensor> {
    if p <= 0.0 || mode == Mode::Eval {
        return Ok(x.clone());
    }
    ops::dropout(x, p as f32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn zoneout_eval_is_expectation() {
        let dev = Device::Cpu;
        let prev = Tensor::new(&[1f32, 2.0, 3.0], &dev).unwrap();
        let next = Tensor::new(&[5f32, 6.0, 7.0], &dev).unwrap();
        let out: Vec<f32> = zoneout(&prev, &next, 0.25, Mode::Eval)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(out, vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn zoneout_train_picks_one_side_per_element() {
        let dev = Device::Cpu;
        let prev = Tensor::zeros(256, candle_core::DType::F32, &dev).unwrap();
        let next = Tensor::ones(256, candle_core::DType::F32, &dev).unwrap();
        let out: Vec<f32> = zoneout(&prev, &next, 0.5, Mode::Train)
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(out.iter().all(|&v| v == 0.0 || v == 1.0));
        let kept = out.iter().filter(|&&v| v == 0.0).count();
        assert!(kept > 64 && kept < 192, "kept {kept} of 256");
    }

    #[test]
    fn dropout_train_zeroes_and_rescales() {
        let dev = Device::Cpu;
        let x = Tensor::ones(1000, candle_core::DType::F32, &dev).unwrap();
        let out: Vec<f32> = dropout(&x, 0.5, Mode::Train).unwrap().to_vec1().unwrap();
        assert!(out.iter().all(|&v| v == 0.0 || v == 2.0));
        let dropped = out.iter().filter(|&&v| v == 0.0).count();
        assert!(dropped > 300 && dropped < 700, "dropped {dropped} of 1000");
    }

    #[test]
    fn zero_rates_are_identity() {
        let dev = Device::Cpu;
        let prev = Tensor::new(&[1f32, 2.0], &dev).unwrap();
        let next = Tensor::new(&[3f32, 4.0], &dev).unwrap();
        let z: Vec<f32> = zoneout(&prev, &next, 0.0, Mode::Train).unwrap().to_vec1().unwrap();
        assert_eq!(z, vec![3.0, 4.0]);
        let d: Vec<f32> = dropout(&next, 0.5, Mode::Eval).unwrap().to_vec1().unwrap();
        assert_eq!(d, vec![3.0, 4.0]);
    }
}
