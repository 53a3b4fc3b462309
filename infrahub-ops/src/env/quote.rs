//! POSIX shell quoting for commands wrapped in `sh -c`.

const SPECIAL: &[char] = &[
    ' ', '\t', '\n', '\'', '"', '$', '`', '\\', '!', '#', '&', '(', ')', '*', ';', '<', '>', '?',
    '|', '{', '}', '[', ']', '~',
];

/// Quotes a single word so the shell passes it through unchanged.
pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    if !value.contains(SPECIAL) {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Quotes every word and joins them with spaces.
pub fn shell_quote_command(parts: &[String]) -> String {
    parts
        .iter()
        .map(|part| shell_quote(part))
        .collect::<Vec<_>>()
        .join(" ")
}
