//! Editing of line-oriented `KEY=value` files such as `/etc/default/gpsd`.
//!
//! Edits keep comments, blank lines and ordering intact so the result still
//! reads like the hand-maintained file it came from.

/// Splits an active line into `(key, value)`. Comments and blanks yield `None`.
fn split_active(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    let (key, value) = trimmed.split_once('=')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, value.trim()))
}

/// Key of a commented-out assignment (`#KEY=` or `# KEY=`).
fn commented_key(line: &str) -> Option<&str> {
    let rest = line.trim_start().strip_prefix('#')?;
    let (key, _) = rest.trim_start().split_once('=')?;
    let key = key.trim();
    if key.is_empty() || key.contains(char::is_whitespace) {
        return None;
    }
    Some(key)
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

pub fn quote(value: &str) -> String {
    format!("\"{}\"", value)
}

pub fn get(text: &str, key: &str) -> Option<String> {
    text.lines()
        .filter_map(split_active)
        .find(|(k, _)| *k == key)
        .map(|(_, v)| unquote(v).to_string())
}

/// Active `(key, value)` pairs in file order, quotes stripped.
pub fn entries(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(split_active)
        .map(|(k, v)| (k.to_string(), unquote(v).to_string()))
        .collect()
}

fn join(lines: Vec<String>) -> String {
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

/// Sets `key` to `value` (inserted verbatim; quote it first if needed).
pub fn set(text: &str, key: &str, value: &str) -> String {
    let wanted = format!("{}={}", key, value);
    let mut lines: Vec<String> = Vec::new();
    let mut placed = false;

    for line in text.lines() {
        match split_active(line) {
            Some((k, _)) if k == key => {
                if !placed {
                    lines.push(wanted.clone());
                    placed = true;
                }
            }
            _ => lines.push(line.to_string()),
        }
    }

    if !placed {
        if let Some(slot) = lines.iter().position(|l| commented_key(l) == Some(key)) {
            lines[slot] = wanted;
        } else {
            lines.push(wanted);
        }
    }
    join(lines)
}

pub fn remove(text: &str, key: &str) -> String {
    join(
        text.lines()
            .filter(|line| !matches!(split_active(line), Some((k, _)) if k == key))
            .map(str::to_string)
            .collect(),
    )
}
