//! Shared helpers: slugs, branch names, hashing, text clamping.

use sha2::{Digest, Sha256};

/// Marker appended when output is cut by [`clamp_text`].
pub const TRUNCATION_MARKER: &str = "\n...<truncated>...";

/// Lowercase, hyphen-separated slug of `title`, at most `max_len` bytes.
/// Falls back to `item` when nothing alphanumeric survives.
pub fn slugify(title: &str, max_len: usize) -> String {
    let slug: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    let slug = if slug.len() > max_len {
        slug[..max_len].trim_end_matches('-').to_string()
    } else {
        slug
    };
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

/// Branch name for a slice: `slice/0007-add-login`.
pub fn branch_name_for_slice(slice_id: i64, title: &str) -> String {
    format!("slice/{:04}-{}", slice_id, slugify(title, 40))
}

/// Truncate `text` to `max_chars` characters, appending [`TRUNCATION_MARKER`].
pub fn clamp_text(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}{}", &text[..idx], TRUNCATION_MARKER),
        None => text.to_string(),
    }
}

/// Lowercase hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Extract a JSON object from text that may contain other content.
/// Uses brace-counting to find the outermost JSON object, skipping braces
/// inside string literals.
pub fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + i + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Add  login -- page!", 60), "add-login-page");
    }

    #[test]
    fn slugify_truncates_without_trailing_dash() {
        assert_eq!(slugify("abc def ghi", 4), "abc");
    }

    #[test]
    fn slugify_falls_back_to_item() {
        assert_eq!(slugify("???", 60), "item");
        assert_eq!(slugify("", 60), "item");
    }

    #[test]
    fn branch_name_is_zero_padded() {
        assert_eq!(branch_name_for_slice(7, "User Signup"), "slice/0007-user-signup");
    }

    #[test]
    fn clamp_text_appends_marker() {
        assert_eq!(clamp_text("hello", 10), "hello");
        assert_eq!(clamp_text("hello world", 5), format!("hello{}", TRUNCATION_MARKER));
    }

    #[test]
    fn clamp_text_respects_char_boundaries() {
        let clamped = clamp_text("ééééé", 2);
        assert!(clamped.starts_with("éé"));
    }

    #[test]
    fn sha256_hex_known_value() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn extract_json_object_with_prose_around() {
        let text = "Here you go:\n```json\n{\"files\": [], \"rationale\": \"a } b\"}\n```";
        assert_eq!(
            extract_json_object(text),
            Some("{\"files\": [], \"rationale\": \"a } b\"}".to_string())
        );
    }

    #[test]
    fn extract_json_object_unclosed() {
        assert_eq!(extract_json_object("{\"a\": 1"), None);
        assert_eq!(extract_json_object("no json"), None);
    }
}
