// Phone key normalization for Parley
// Every lookup into the conversation list goes through normalize_phone

/// Characters that only carry formatting and never distinguish two numbers
const SEPARATORS: [char; 5] = [' ', '-', '(', ')', '.'];

/// Reduce a raw phone value to the conversation key.
///
/// Leading `+` signs and visual separators are removed, so `"+91 98765-43210"`
/// and `"919876543210"` produce the same key. Returns `None` when nothing is
/// left.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let key: String = raw
        .trim()
        .trim_start_matches('+')
        .chars()
        .filter(|c| !SEPARATORS.contains(c))
        .collect();

    if key.is_empty() {
        None
    } else {
        Some(key)
    }
}
