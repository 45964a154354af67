/// Drops everything after the last newline.
///
/// Summarizers tend to close with a one-line sign-off; this removes it. Text
/// without a newline is returned unchanged.
pub fn strip_trailing_line(s: &str) -> &str {
    match s.rfind('\n') {
        Some(idx) => s[..idx].trim_end(),
        None => s,
    }
}
