use crate::sample::{FrameLayout, Sample};
use std::fmt::Write;

/// Positional, comma separated, newline terminated. The firmware parses by
/// index so the field order here is the whole protocol.
pub fn encode(sample: &Sample, layout: FrameLayout) -> String {
    let fields = match layout {
        FrameLayout::Full => vec![
            sample.cpu_usage,
            sample.cpu_temp,
            sample.ram_usage,
            sample.ram_temp,
            sample.gpu_usage,
            sample.gpu_temp,
        ],
        FrameLayout::Reduced => vec![sample.cpu_usage, sample.ram_usage, sample.gpu_usage],
    };

    let mut line = String::with_capacity(fields.len() * 6);
    for (i, v) in fields.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        let _ = write!(line, "{v:.1}");
    }
    line.push('\n');
    line
}
