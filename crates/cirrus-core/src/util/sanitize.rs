//! Filename sanitization for the virtual filesystem.

/// Characters that cannot appear in a path component.
const FORBIDDEN: &[char] = &[
    '~', '"', '#', '%', '&', '*', ':', '<', '>', '?', '/', '\\', '{', '|', '}',
];

/// Replaces forbidden characters with `_` and trims trailing dots and
/// spaces. Idempotent: `sanitize(sanitize(s)) == sanitize(s)`.
pub fn sanitize(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) { '_' } else { c })
        .collect();
    replaced
        .trim_end_matches(|c| c == '.' || c == ' ')
        .to_string()
}
