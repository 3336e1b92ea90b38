//! `--device` parsing.

use anyhow::{bail, Context};
use candle_core::Device;

/// Parse `cpu`, `cuda`, `cuda:N`, `metal` or `metal:N`.
///
/// Accelerators fail here (not mid-training) when candle was built without
/// the matching feature or the ordinal does not exist.
pub fn parse_device(name: &str) -> anyhow::Result<Device> {
    let (kind, ordinal) = match name.split_once(':') {
        Some((kind, ord)) => {
            let ord: usize = ord
                .parse()
                .with_context(|| format!("invalid device ordinal in `{name}`"))?;
            (kind, ord)
        }
        None => (name, 0),
    };
    let device = match kind {
        "cpu" if ordinal == 0 => Device::Cpu,
        "cuda" => Device::new_cuda(ordinal).with_context(|| format!("open device {name}"))?,
        "metal" => Device::new_metal(ordinal).with_context(|| format!("open device {name}"))?,
        _ => bail!("unknown device `{name}` (expected cpu, cuda[:N] or metal[:N])"),
    };
    Ok(device)
}
