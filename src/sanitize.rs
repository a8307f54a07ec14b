//! Input sanitization at the client boundary.
//!
//! The bridge itself never escapes anything; it hands every client-supplied
//! string through an [`InputSanitizer`] before the value can reach session
//! state or a process's input.

use std::path::{Component, Path, PathBuf};

const MAX_INPUT_LEN: usize = 10_000;
const MAX_SESSION_NAME_LEN: usize = 100;
const MAX_FILENAME_LEN: usize = 255;

/// Contract for the sanitization collaborator.
pub trait InputSanitizer: Send + Sync {
    /// Strip control characters and cap length. Empty means "nothing to send".
    fn sanitize_text(&self, input: &str) -> String;
    /// Empty means the name is unusable.
    fn sanitize_name(&self, name: &str) -> String;
    /// Empty means the path is unusable.
    fn sanitize_path(&self, path: &str) -> String;
    /// Always returns a usable file name.
    fn sanitize_filename(&self, filename: &str) -> String;
    fn is_valid_image_payload(&self, bytes: &[u8], max_size: usize) -> bool;
}

/// Default rules: control characters other than tab/LF/CR are removed, names
/// lose markup characters, paths lose `..` components, file names are reduced
/// to a conservative character set, and images must be JPEG, PNG, GIF or
/// WebP.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSanitizer;

fn is_stripped_control(c: char) -> bool {
    matches!(c, '\u{00}'..='\u{08}' | '\u{0b}' | '\u{0c}' | '\u{0e}'..='\u{1f}' | '\u{7f}')
}

fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl InputSanitizer for StandardSanitizer {
    fn sanitize_text(&self, input: &str) -> String {
        truncate_chars(input, MAX_INPUT_LEN)
            .chars()
            .filter(|c| !is_stripped_control(*c))
            .collect()
    }

    fn sanitize_name(&self, name: &str) -> String {
        truncate_chars(name, MAX_SESSION_NAME_LEN)
            .chars()
            .filter(|c| !is_stripped_control(*c) && !matches!(c, '<' | '>' | '"' | '\'' | '&'))
            .collect::<String>()
            .trim()
            .to_string()
    }

    fn sanitize_path(&self, path: &str) -> String {
        if path.contains('\0') || path.trim().is_empty() {
            return String::new();
        }
        let normalized: PathBuf = Path::new(path.trim())
            .components()
            .filter(|c| !matches!(c, Component::ParentDir | Component::CurDir))
            .collect();
        normalized.to_string_lossy().into_owned()
    }

    fn sanitize_filename(&self, filename: &str) -> String {
        let mut out: String = filename
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        while out.contains("..") {
            out = out.replace("..", ".");
        }
        if out.starts_with('.') {
            out.replace_range(..1, "_");
        }
        out.truncate(MAX_FILENAME_LEN);
        if out.is_empty() {
            "file".to_string()
        } else {
            out
        }
    }

    fn is_valid_image_payload(&self, bytes: &[u8], max_size: usize) -> bool {
        if bytes.is_empty() || bytes.len() > max_size {
            return false;
        }
        image_signature(bytes).is_some()
    }
}

/// Recognize the image container from its magic bytes.
pub fn image_signature(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("image/jpeg")
    } else if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        Some("image/png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("image/gif")
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        Some("image/webp")
    } else {
        None
    }
}
