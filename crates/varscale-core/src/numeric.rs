//! Numeric hygiene at the data model boundary.
//!
//! Every number that enters the system model from a decimal string or an
//! upstream metric goes through here. NaN and infinities become zero so they
//! can never reach the latency formulas or be written back to a status.

/// Replace NaN/infinite values with zero.
pub fn sanitize(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Like [`sanitize`], but logs the substitution with the field name.
pub fn sanitize_field(field: &str, value: f64) -> f64 {
    if value.is_finite() {
        return value;
    }
    tracing::debug!(field, value = %value, "non-finite value replaced with 0");
    0.0
}

/// Parse a decimal string coming from a status or config field.
/// Empty, unparseable, negative or non-finite input reads as zero.
pub fn parse_decimal(field: &str, raw: &str) -> f64 {
    let raw = raw.trim();
    if raw.is_empty() {
        return 0.0;
    }
    match raw.parse::<f64>() {
        Ok(v) if v.is_finite() && v >= 0.0 => v,
        Ok(v) => {
            tracing::debug!(field, value = %v, "out-of-range value replaced with 0");
            0.0
        }
        Err(_) => {
            tracing::debug!(field, raw, "unparseable decimal replaced with 0");
            0.0
        }
    }
}

/// Render a value for a status field (`^\d+(\.\d+)?$`, two decimals).
pub fn format_decimal(value: f64) -> String {
    let v = sanitize(value);
    let v = if v > 0.0 { v } else { 0.0 };
    format!("{v:.2}")
}

/// Whether `s` matches `^\d+(\.\d+)?$`.
pub fn is_decimal_string(s: &str) -> bool {
    let (int, frac) = match s.split_once('.') {
        Some((i, f)) => (i, Some(f)),
        None => (s, None),
    };
    let digits = |p: &str| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit());
    digits(int) && frac.map_or(true, digits)
}
