//! Power formatting for operator-facing text

/// `2992.0` → `"2.99 kW"`, `950.0` → `"950 W"`
pub fn format_power(watts: f64) -> String {
    if watts >= 1000.0 {
        format!("{:.2} kW", watts / 1000.0)
    } else {
        format!("{:.0} W", watts)
    }
}

/// Parse `"3kW"`, `"3000W"` or `"3000"` into watts
pub fn parse_power(text: &str) -> Option<f64> {
    let text = text.trim().to_ascii_lowercase();

    let watts = if let Some(kw) = text.strip_suffix("kw") {
        kw.trim().parse::<f64>().ok()? * 1000.0
    } else if let Some(w) = text.strip_suffix('w') {
        w.trim().parse::<f64>().ok()?
    } else {
        text.parse::<f64>().ok()?
    };

    (watts.is_finite() && watts >= 0.0).then_some(watts)
}
