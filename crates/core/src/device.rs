//! Device selection from the `device` config string.

use candle_core::{Device, Result};

/// `cpu`, `cuda`, `cuda:N`, `metal`, `metal:N`, or `auto` (CUDA 0 if available).
pub fn select_device(name: &str) -> Result<Device> {
    let name = name.trim().to_ascii_lowercase();
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, n)) => {
            let n = n
                .parse::<usize>()
                .map_err(|_| candle_core::Error::Msg(format!("bad device ordinal in `{name}`")))?;
            (kind.to_string(), n)
        }
        None => (name.clone(), 0),
    };
    match kind.as_str() {
        "cpu" => Ok(Device::Cpu),
        "cuda" => Device::new_cuda(ordinal),
        "metal" | "mps" => Device::new_metal(ordinal),
        "auto" => Device::cuda_if_available(ordinal),
        other => Err(candle_core::Error::Msg(format!("unknown device `{other}`"))),
    }
}
