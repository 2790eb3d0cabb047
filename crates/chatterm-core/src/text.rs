//! Small text helpers shared by the loop and the transport.

/// Split at the first whitespace character. Both parts are trimmed.
#[must_use]
pub fn split_first_and_others(s: &str) -> (&str, &str) {
    match s.find([' ', '\r', '\n', '\t', '\x0c']) {
        Some(i) => (&s[..i], s[i + 1..].trim()),
        None => (s.trim(), ""),
    }
}

/// Split into chunks of at most `size` characters.
#[must_use]
pub fn chunks(s: &str, size: usize) -> Vec<String> {
    if s.is_empty() {
        return Vec::new();
    }
    if size == 0 {
        return vec![s.to_string()];
    }
    let chars: Vec<char> = s.chars().collect();
    chars.chunks(size).map(|c| c.iter().collect()).collect()
}

/// In lines of the form `<field> <data>`, find the data of the first line
/// whose first field equals `field`.
#[must_use]
pub fn find_line_data_by_first_field<'a>(lines: &[&'a str], field: &str) -> Option<&'a str> {
    lines.iter().find_map(|line| {
        let (first, data) = split_first_and_others(line);
        (first == field && !data.is_empty()).then_some(data)
    })
}

const UNITS: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];

#[allow(clippy::cast_precision_loss)]
fn scale(bytes: u64) -> (f64, usize) {
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    (value, unit)
}

/// Human readable size, e.g. `1.5KiB`.
#[must_use]
pub fn bytes_size(bytes: u64) -> String {
    let (value, unit) = scale(bytes);
    if unit == 0 {
        format!("{bytes}B")
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

/// Compact size of at most four characters, e.g. `1.5K` or `320M`.
#[must_use]
pub fn bytes_size_around(bytes: u64) -> String {
    let (value, unit) = scale(bytes);
    let suffix = if unit == 0 { "" } else { &UNITS[unit][..1] };
    if unit == 0 {
        format!("{bytes}")
    } else if value < 10.0 {
        format!("{value:.1}{suffix}")
    } else {
        format!("{value:.0}{suffix}")
    }
}
