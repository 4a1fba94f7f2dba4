use chrono::Duration;

use crate::error::InputError;

/// Parse a lookback span.
///
/// Accepted forms:
/// - ISO 8601 durations without years or months: `P7D`, `PT36H`, `P1DT12H`, `P2W`
/// - shorthand: `7d`, `36h`, `90m`, `3600s`, `1w`
/// - SQL interval style, possibly compound: `7 days`, `1 day 12 hours`
///
/// The span must be strictly positive.
pub fn parse_lookback(input: &str) -> Result<Duration, InputError> {
    let s = input.trim();
    let malformed = || InputError::MalformedLookback(input.to_string());

    if s.is_empty() {
        return Err(malformed());
    }
    if s.starts_with('-') {
        return Err(InputError::NonPositiveLookback);
    }

    let secs = if s.starts_with('P') || s.starts_with('p') {
        parse_iso8601(&s[1..]).ok_or_else(malformed)?
    } else if s.contains(char::is_whitespace) {
        parse_interval(s).ok_or_else(malformed)?
    } else {
        parse_shorthand(s).ok_or_else(malformed)?
    };

    if secs <= 0 {
        return Err(InputError::NonPositiveLookback);
    }
    Duration::try_seconds(secs).ok_or_else(malformed)
}

fn unit_seconds(unit: &str) -> Option<i64> {
    match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Some(1),
        "m" | "min" | "mins" | "minute" | "minutes" => Some(60),
        "h" | "hr" | "hrs" | "hour" | "hours" => Some(3_600),
        "d" | "day" | "days" => Some(86_400),
        "w" | "week" | "weeks" => Some(604_800),
        _ => None,
    }
}

fn parse_iso8601(body: &str) -> Option<i64> {
    if body.is_empty() {
        return None;
    }
    let (date_part, time_part) = match body.find(['T', 't']) {
        Some(idx) => (&body[..idx], Some(&body[idx + 1..])),
        None => (body, None),
    };

    let mut total: i64 = 0;
    for (value, designator) in iso_components(date_part)? {
        let unit = match designator {
            'D' => 86_400,
            'W' => 604_800,
            _ => return None,
        };
        total = total.checked_add(value.checked_mul(unit)?)?;
    }
    if let Some(time_part) = time_part {
        let components = iso_components(time_part)?;
        if components.is_empty() {
            return None;
        }
        for (value, designator) in components {
            let unit = match designator {
                'H' => 3_600,
                'M' => 60,
                'S' => 1,
                _ => return None,
            };
            total = total.checked_add(value.checked_mul(unit)?)?;
        }
    }
    Some(total)
}

/// Split `7D12H`-style text into `(7, 'D'), (12, 'H')`.
fn iso_components(text: &str) -> Option<Vec<(i64, char)>> {
    let mut out = Vec::new();
    let mut digits = String::new();
    for c in text.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            if digits.is_empty() {
                return None;
            }
            out.push((digits.parse().ok()?, c.to_ascii_uppercase()));
            digits.clear();
        }
    }
    if !digits.is_empty() {
        return None;
    }
    Some(out)
}

fn parse_shorthand(s: &str) -> Option<i64> {
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (number, unit) = s.split_at(split);
    let value: i64 = number.parse().ok()?;
    value.checked_mul(unit_seconds(unit)?)
}

fn parse_interval(s: &str) -> Option<i64> {
    let tokens: Vec<&str> = s.split_whitespace().collect();
    if tokens.len() % 2 != 0 {
        return None;
    }
    let mut total: i64 = 0;
    for pair in tokens.chunks(2) {
        let value: i64 = pair[0].parse().ok()?;
        total = total.checked_add(value.checked_mul(unit_seconds(pair[1])?)?)?;
    }
    Some(total)
}
