//! Portable path sanitization for file paths recovered from a manifest.
//!
//! A path segment from an `info.files[].path` entry may contain characters
//! that are illegal on some filesystem a download directory happens to sit
//! on (most commonly Windows, mounted under Linux via a network share).
//! `sanitize` produces a segment that is safe everywhere; `is_portable`
//! reports whether a segment already is.

const FORBIDDEN: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

const RESERVED_DEVICE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL",
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Sanitizes a single path segment (not a whole path with separators).
pub fn sanitize(segment: &str) -> String {
    let trimmed = segment.trim();

    let replaced: String = trimmed
        .chars()
        .map(|c| if FORBIDDEN.contains(&c) || c.is_control() { '_' } else { c })
        .collect();

    if is_reserved_device_name(&replaced) {
        format!("_{replaced}")
    } else {
        replaced
    }
}

/// True iff `segment` would be left unchanged by [`sanitize`].
pub fn is_portable(segment: &str) -> bool {
    sanitize(segment) == segment
}

fn is_reserved_device_name(segment: &str) -> bool {
    let stem = segment.split('.').next().unwrap_or(segment);
    RESERVED_DEVICE_NAMES.iter().any(|reserved| reserved.eq_ignore_ascii_case(stem))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_forbidden_characters() {
        assert_eq!(sanitize("a<b>c:d\"e/f\\g|h?i*j"), "a_b_c_d_e_f_g_h_i_j");
    }

    #[test]
    fn trims_whitespace() {
        assert_eq!(sanitize("  name.txt  "), "name.txt");
    }

    #[test]
    fn escapes_reserved_device_names_case_insensitively() {
        assert_eq!(sanitize("con"), "_con");
        assert_eq!(sanitize("CON"), "_CON");
        assert_eq!(sanitize("com3.txt"), "_com3.txt");
        assert_eq!(sanitize("console"), "console");
    }

    #[test]
    fn sanitize_is_idempotent() {
        for s in ["plain", "con", "a<b", "  pad  ", "COM1.tar.gz"] {
            let once = sanitize(s);
            let twice = sanitize(&once);
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn is_portable_matches_sanitize_fixed_point() {
        for s in ["plain.txt", "con", "bad<name", "trailing "] {
            assert_eq!(is_portable(s), sanitize(s) == s);
        }
    }
}
