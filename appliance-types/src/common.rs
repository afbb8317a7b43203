//! Size helpers shared across models

use anyhow::Result;
use num_format::{Locale, ToFormattedString};

/// One mebibyte. Partition sizes and offsets are expressed in this unit.
pub const MIB: u64 = 1024 * 1024;

/// Convert a mebibyte count to bytes
pub fn mb_to_bytes(mb: u64) -> u64 {
    mb.saturating_mul(MIB)
}

/// Convert bytes to human-readable format (e.g., "1.50 GB")
pub fn bytes_to_pretty(bytes: &u64, add_bytes: bool) -> String {
    let mut steps = 0;
    let mut val: f64 = *bytes as f64;

    while val > 1024. && steps <= 8 {
        val /= 1024.;
        steps += 1;
    }

    let unit = match steps {
        0 => "B",
        1 => "KB",
        2 => "MB",
        3 => "GB",
        4 => "TB",
        5 => "PB",
        6 => "EB",
        7 => "ZB",
        8 => "YB",
        _ => "Not Supported",
    };

    if add_bytes {
        let bytes_str = bytes.to_formatted_string(&Locale::en);
        format!("{:.2} {} ({} bytes)", val, unit, bytes_str)
    } else {
        format!("{:.2} {}", val, unit)
    }
}

/// Parse human-readable format to bytes (e.g., "1.5 GB" -> bytes)
pub fn pretty_to_bytes(pretty: &str) -> Result<u64> {
    let split = pretty.split_whitespace().collect::<Vec<&str>>();
    let string_value = split
        .first()
        .ok_or_else(|| anyhow::anyhow!("Invalid input"))?;

    let val: f64 = string_value.parse()?;
    let unit = if split.len() > 1 {
        *split.last().ok_or_else(|| anyhow::anyhow!("Invalid input"))?
    } else {
        "B"
    };

    let steps = match unit {
        "B" => 0,
        "KB" | "K" => 1,
        "MB" | "M" => 2,
        "GB" | "G" => 3,
        "TB" | "T" => 4,
        _ => return Err(anyhow::anyhow!("Invalid unit: {unit}")),
    };

    Ok((val * 1024f64.powi(steps)) as u64)
}
