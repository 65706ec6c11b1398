use std::time::Duration;

use anyhow::Result;

const NANOS_PER_SEC: u128 = 1_000_000_000;

// Longest suffixes first, so that "ms" is not taken for "m".
const UNITS: &[(&str, f64)] = &[
    ("ns", 1.0),
    ("us", 1_000.0),
    ("\u{00B5}s", 1_000.0), // U+00B5 = micro symbol
    ("\u{03BC}s", 1_000.0), // U+03BC = Greek letter mu
    ("ms", 1_000_000.0),
    ("s", 1_000_000_000.0),
    ("m", 60.0 * 1_000_000_000.0),
    ("h", 60.0 * 60.0 * 1_000_000_000.0),
];

/// Parses a duration written the way configuration files of the tool
/// expect it: a sequence of decimal numbers, each with an optional fraction
/// and a mandatory unit suffix, e.g. "10m", "15s", "1h30m" or "1.5s".
///
/// Valid units are "ns", "us" (or "µs"), "ms", "s", "m", "h".
/// A bare "0" is accepted. Negative durations are rejected.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let mut rest = input.strip_prefix('+').unwrap_or(input);
    anyhow::ensure!(
        !rest.starts_with('-'),
        "Negative durations are not supported: {}",
        input
    );

    if rest == "0" {
        return Ok(Duration::ZERO);
    }
    anyhow::ensure!(!rest.is_empty(), "Invalid duration: {:?}", input);

    let mut total_nanos = 0u128;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| c != '.' && !c.is_ascii_digit())
            .unwrap_or(rest.len());
        anyhow::ensure!(number_len > 0, "Missing number in duration: {:?}", input);
        let (number, tail) = rest.split_at(number_len);
        let number: f64 = number
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid number in duration: {:?}", input))?;

        let unit_len = tail
            .find(|c: char| c == '.' || c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (unit, tail) = tail.split_at(unit_len);
        let multiplier = UNITS
            .iter()
            .find_map(|(name, mult)| (*name == unit).then_some(*mult))
            .ok_or_else(|| anyhow::anyhow!("Invalid duration unit {:?} in {:?}", unit, input))?;

        // Check before the float-to-int conversion so that it cannot saturate
        let part = number * multiplier;
        anyhow::ensure!(
            part <= u64::MAX as f64,
            "Duration out of representable range: {:?}",
            input
        );
        total_nanos = total_nanos
            .checked_add(part as u128)
            .ok_or_else(|| anyhow::anyhow!("Duration out of representable range: {:?}", input))?;

        rest = tail;
    }

    let secs: u64 = (total_nanos / NANOS_PER_SEC)
        .try_into()
        .map_err(|_| anyhow::anyhow!("Duration out of representable range: {:?}", input))?;
    Ok(Duration::new(secs, (total_nanos % NANOS_PER_SEC) as u32))
}

/// Formats a duration compactly for log lines: "1h2m3.0s" for long
/// durations, three significant digits ("1.25ms", "830μs") for short ones.
pub fn format_duration(d: Duration) -> String {
    if d == Duration::ZERO {
        return "0s".to_owned();
    }

    if d >= Duration::from_secs(1) {
        let hours = d.as_secs() / 3600;
        let minutes = (d.as_secs() / 60) % 60;
        let seconds = d.as_secs_f64() % 60.0;

        let mut out = String::new();
        if hours > 0 {
            out += &format!("{}h", hours);
        }
        if minutes > 0 {
            out += &format!("{}m", minutes);
        }
        out += &format!("{:.1}s", seconds);
        return out;
    }

    let nanos = d.subsec_nanos() as f64;
    let (value, unit) = if nanos >= 1_000_000.0 {
        (nanos / 1_000_000.0, "ms")
    } else if nanos >= 1_000.0 {
        (nanos / 1_000.0, "μs")
    } else {
        return format!("{}ns", d.subsec_nanos());
    };

    let precision = if value >= 100.0 {
        0
    } else if value >= 10.0 {
        1
    } else {
        2
    };
    format!("{:.*}{}", precision, value, unit)
}
