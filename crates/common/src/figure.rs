//! Diagnostic figures: a dense matrix plus axis labels, serialised as JSON.

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

/// Row-major `rows × cols` matrix (e.g. frames × mel bins, frames × classes).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Figure {
    pub title: String,
    pub rows: usize,
    pub cols: usize,
    pub values: Vec<f32>,
}

impl Figure {
    /// Build from a 2-D tensor, or a 3-D tensor with a leading batch of 1.
    pub fn from_tensor(title: impl Into<String>, t: &Tensor) -> candle_core::Result<Self> {
        let t = if t.rank() == 3 { t.squeeze(0)? } else { t.clone() };
        let (rows, cols) = t.dims2()?;
        let values = t.to_dtype(DType::F32)?.flatten_all()?.to_vec1()?;
        Ok(Self {
            title: title.into(),
            rows,
            cols,
            values,
        })
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn from_batched_tensor() {
        let t = Tensor::arange(0f32, 6.0, &Device::Cpu)
            .unwrap()
            .reshape((1, 2, 3))
            .unwrap();
        let fig = Figure::from_tensor("probvec", &t).unwrap();
        assert_eq!((fig.rows, fig.cols), (2, 3));
        assert_eq!(fig.values[5], 5.0);
    }
}
