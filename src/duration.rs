// src/duration.rs
//
// =============================================================================
// GPUHOLD: DURATION GRAMMAR (spec_full.md §6.2)
// =============================================================================
//
// "<number><unit>", unit in {s, m, h, d}, integer or decimal (e.g. "0.5h").
// Empty string defaults to 8h.

use std::time::Duration;

const DEFAULT: Duration = Duration::from_secs(8 * 3600);

pub fn parse_duration(raw: &str) -> anyhow::Result<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(DEFAULT);
    }

    let unit_char = trimmed
        .chars()
        .last()
        .ok_or_else(|| anyhow::anyhow!("empty duration"))?;

    let (number_part, multiplier) = match unit_char {
        's' => (&trimmed[..trimmed.len() - 1], 1.0),
        'm' => (&trimmed[..trimmed.len() - 1], 60.0),
        'h' => (&trimmed[..trimmed.len() - 1], 3600.0),
        'd' => (&trimmed[..trimmed.len() - 1], 86400.0),
        _ => {
            return Err(anyhow::anyhow!(
                "duration {trimmed:?} is missing a unit suffix (s, m, h, d)"
            ))
        }
    };

    let value: f64 = number_part
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid duration number {number_part:?}: {e}"))?;
    if value < 0.0 {
        return Err(anyhow::anyhow!("duration must be non-negative, got {value}"));
    }

    Ok(Duration::from_secs_f64(value * multiplier))
}
