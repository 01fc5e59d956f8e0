//! Exponential moving average of model weights.
//!
//! The shadow copy is updated after every optimiser step. For evaluation and
//! checkpointing the shadow weights are swapped in through [`EmaSwap`], which
//! puts the live weights back when it is dropped, on success and error paths
//! alike.

use candle_core::{Result, Tensor, Var};

pub struct Ema {
    decay: f64,
    vars: Vec<Var>,
    shadow: Vec<Tensor>,
}

impl Ema {
    pub fn new(vars: Vec<Var>, decay: f64) -> Result<Self> {
        let shadow = vars
            .iter()
            .map(|v| v.as_tensor().detach().copy())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            decay,
            vars,
            shadow,
        })
    }

    /// `shadow = decay · shadow + (1 - decay) · live`.
    pub fn update(&mut self) -> Result<()> {
        for (var, shadow) in self.vars.iter().zip(self.shadow.iter_mut()) {
            let live = var.as_tensor().detach();
            let next = (shadow.affine(self.decay, 0.0)? + live.affine(1.0 - self.decay, 0.0)?)?;
            *shadow = next.detach();
        }
        Ok(())
    }

    /// Install the shadow weights until the returned guard is dropped.
    pub fn swap_in(&self) -> Result<EmaSwap<'_>> {
        let live = self
            .vars
            .iter()
            .map(|v| v.as_tensor().detach().copy())
            .collect::<Result<Vec<_>>>()?;
        let guard = EmaSwap { ema: self, live };
        for (var, shadow) in self.vars.iter().zip(&self.shadow) {
            var.set(shadow)?;
        }
        Ok(guard)
    }
}

/// Restores the live weights on drop.
pub struct EmaSwap<'a> {
    ema: &'a Ema,
    live: Vec<Tensor>,
}

impl Drop for EmaSwap<'_> {
    fn drop(&mut self) {
        for (var, live) in self.ema.vars.iter().zip(&self.live) {
            if let Err(e) = var.set(live) {
                tracing::error!(error = %e, "failed to restore live weights after EMA swap");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn values(v: &Var) -> Vec<f32> {
        v.as_tensor().flatten_all().unwrap().to_vec1().unwrap()
    }

    #[test]
    fn update_moves_shadow_towards_live() {
        let var = Var::zeros(2, DType::F32, &Device::Cpu).unwrap();
        let mut ema = Ema::new(vec![var.clone()], 0.9).unwrap();
        var.set(&Tensor::ones(2, DType::F32, &Device::Cpu).unwrap()).unwrap();
        ema.update().unwrap();
        let shadow: Vec<f32> = ema.shadow[0].to_vec1().unwrap();
        assert!((shadow[0] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn swap_restores_live_weights_on_drop() {
        let var = Var::zeros(3, DType::F32, &Device::Cpu).unwrap();
        let mut ema = Ema::new(vec![var.clone()], 0.5).unwrap();
        var.set(&Tensor::ones(3, DType::F32, &Device::Cpu).unwrap()).unwrap();
        ema.update().unwrap();

        {
            let _swap = ema.swap_in().unwrap();
            assert_eq!(values(&var), vec![0.5; 3]);
        }
        assert_eq!(values(&var), vec![1.0; 3]);
    }

    #[test]
    fn swap_restores_even_when_evaluation_fails() {
        let var = Var::ones(2, DType::F32, &Device::Cpu).unwrap();
        let ema = Ema::new(vec![var.clone()], 0.5).unwrap();
        var.set(&Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap()).unwrap();

        let failing = || -> anyhow::Result<()> {
            let _swap = ema.swap_in()?;
            assert_eq!(values(&var), vec![1.0; 2]);
            anyhow::bail!("evaluation blew up")
        };
        assert!(failing().is_err());
        assert_eq!(values(&var), vec![0.0; 2]);
    }
}
