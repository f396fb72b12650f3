//! Go-style duration strings (`90s`, `5m`, `1h30m`, `1.5h`) as used in
//! annotations and `spec.timeout`.

use std::time::Duration;

use anyhow::{anyhow, bail, Result};

pub fn parse(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }
    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest.find(|c: char| !(c.is_ascii_digit() || c == '.')).unwrap_or(rest.len());
        if num_len == 0 {
            bail!("invalid duration {:?}: expected a number", input);
        }
        let value: f64 = rest[..num_len].parse().map_err(|_| anyhow!("invalid duration {:?}", input))?;
        rest = &rest[num_len..];
        let unit_len = rest.find(|c: char| c.is_ascii_digit() || c == '.').unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => bail!("invalid duration {:?}: missing unit", input),
            other => bail!("invalid duration {:?}: unknown unit {:?}", input, other),
        };
        total += value * scale;
        rest = &rest[unit_len..];
    }
    // same bound as a signed 64-bit nanosecond count
    if !(total <= i64::MAX as f64 / 1e9) {
        bail!("invalid duration {:?}: out of range", input);
    }
    Duration::try_from_secs_f64(total).map_err(|_| anyhow!("invalid duration {:?}: out of range", input))
}

/// Render like Go's `time.Duration.String`, truncated to milliseconds.
pub fn format(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 {
        return "0s".to_string();
    }
    if ms < 1000 {
        return format!("{}ms", ms);
    }
    let hours = ms / 3_600_000;
    let minutes = (ms / 60_000) % 60;
    let secs = (ms % 60_000) as f64 / 1000.0;
    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if hours > 0 || minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    let secs = format!("{:.3}", secs);
    let secs = secs.trim_end_matches('0').trim_end_matches('.');
    out.push_str(secs);
    out.push('s');
    out
}
