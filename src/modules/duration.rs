// Google duration grammar: one or more `<number><unit>` segments where the
// number may carry a decimal part and the unit is one of h|m|s|ms. Segments
// concatenate, e.g. "1h16m0.667923083s". Unparseable input is "no hint",
// never an error.

pub fn parse_duration_ms(input: &str) -> Option<i64> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }

    let bytes = s.as_bytes();
    let mut i = 0;
    let mut total_ms = 0f64;
    while i < bytes.len() {
        let start = i;
        while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
            i += 1;
        }
        if i == start {
            return None;
        }
        let value: f64 = s[start..i].parse().ok()?;

        let unit_ms = match bytes.get(i) {
            Some(b'h') => {
                i += 1;
                3_600_000f64
            }
            Some(b's') => {
                i += 1;
                1_000f64
            }
            Some(b'm') => {
                if bytes.get(i + 1) == Some(&b's') {
                    i += 2;
                    1f64
                } else {
                    i += 1;
                    60_000f64
                }
            }
            _ => return None,
        };
        total_ms += value * unit_ms;
    }

    Some(total_ms.round() as i64)
}

// Canonical compound rendering; parse_duration_ms(format_duration_ms(n)) == n
// for any non-negative integer n.
pub fn format_duration_ms(ms: i64) -> String {
    if ms <= 0 {
        return "0s".to_string();
    }

    let mut rest = ms;
    let hours = rest / 3_600_000;
    rest %= 3_600_000;
    let minutes = rest / 60_000;
    rest %= 60_000;
    let seconds = rest / 1_000;
    let millis = rest % 1_000;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{}h", hours));
    }
    if minutes > 0 {
        out.push_str(&format!("{}m", minutes));
    }
    if seconds > 0 && millis > 0 {
        out.push_str(&format!("{}.{:03}s", seconds, millis));
    } else if seconds > 0 {
        out.push_str(&format!("{}s", seconds));
    } else if millis > 0 {
        out.push_str(&format!("{}ms", millis));
    }
    out
}
