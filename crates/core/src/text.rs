//! Text cleanup applied to transcriptions and backend replies.

use once_cell::sync::Lazy;
use regex::Regex;

static EMOJI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "[",
        "\u{1F600}-\u{1F64F}", // emoticons
        "\u{1F300}-\u{1F5FF}", // symbols & pictographs
        "\u{1F680}-\u{1F6FF}", // transport & map symbols
        "\u{1F700}-\u{1F77F}", // alchemical symbols
        "\u{1F780}-\u{1F7FF}", // geometric shapes
        "\u{1F800}-\u{1F8FF}", // supplemental arrows-C
        "\u{1F900}-\u{1F9FF}", // supplemental symbols
        "\u{1FA00}-\u{1FA6F}", // chess symbols
        "\u{1FA70}-\u{1FAFF}", // symbols extended-A
        "\u{2702}-\u{27B0}",   // dingbats
        "\u{24C2}-\u{1F251}",
        "]+",
    ))
    .expect("emoji pattern compiles")
});

/// Strip emoji codepoints before sending text to the synthesizer.
pub fn remove_emojis(text: &str) -> String {
    EMOJI.replace_all(text, "").into_owned()
}

/// Lowercase and collapse whitespace. Used to compare a fresh transcription
/// against the previous unstable one.
pub fn normalize_text(text: &str) -> String {
    let mut normalized = String::with_capacity(text.len());
    let mut in_space = false;
    for ch in text.chars() {
        if ch.is_whitespace() {
            if !in_space && !normalized.is_empty() {
                normalized.push(' ');
            }
            in_space = true;
        } else {
            normalized.extend(ch.to_lowercase());
            in_space = false;
        }
    }
    if normalized.ends_with(' ') {
        normalized.pop();
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_lowercases_and_collapses() {
        assert_eq!(normalize_text("  Hello\tWORLD  "), "hello world");
        assert_eq!(normalize_text("a  b\n\nc"), "a b c");
        assert_eq!(normalize_text(""), "");
    }

    #[test]
    fn emojis_are_removed() {
        assert_eq!(remove_emojis("Hello \u{1F600} world"), "Hello  world");
        assert_eq!(remove_emojis("ok \u{2708}"), "ok ");
    }

    #[test]
    fn ascii_passes_through() {
        let input = "Plain text only.";
        assert_eq!(remove_emojis(input), input);
    }
}
