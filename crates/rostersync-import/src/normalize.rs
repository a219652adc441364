//! Transliteration of Unicode text into ASCII-safe forms.
//!
//! German umlauts and a handful of ligatures map to digraphs (`ü` → `ue`,
//! `ß` → `ss`, `Æ` → `Ae`). Other Latin letters lose their diacritics
//! (`é` → `e`). Anything else passes through unchanged, so the function is
//! total and idempotent.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Digraph replacements applied before diacritic stripping.
const DIGRAPHS: &[(char, &str)] = &[
    ('ä', "ae"),
    ('ö', "oe"),
    ('ü', "ue"),
    ('Ä', "Ae"),
    ('Ö', "Oe"),
    ('Ü', "Ue"),
    ('ß', "ss"),
    ('ẞ', "SS"),
    ('æ', "ae"),
    ('Æ', "Ae"),
    ('œ', "oe"),
    ('Œ', "Oe"),
    ('ø', "oe"),
    ('Ø', "Oe"),
    ('þ', "th"),
    ('Þ', "Th"),
    ('ð', "d"),
    ('Ð', "D"),
    ('đ', "d"),
    ('Đ', "D"),
    ('ł', "l"),
    ('Ł', "L"),
    ('ı', "i"),
];

/// Normalize `text` when `enabled`, otherwise return it unchanged.
pub fn normalize(text: &str, enabled: bool) -> String {
    if enabled {
        transliterate(text)
    } else {
        text.to_string()
    }
}

/// Transliterate every character of `text` that has an ASCII form.
pub fn transliterate(text: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.nfc() {
        push_transliterated(&mut out, c);
    }
    out
}

fn push_transliterated(out: &mut String, c: char) {
    if c.is_ascii() {
        out.push(c);
        return;
    }
    if let Some((_, digraph)) = DIGRAPHS.iter().find(|(from, _)| *from == c) {
        out.push_str(digraph);
        return;
    }
    let base: String = std::iter::once(c)
        .nfd()
        .filter(|d| !is_combining_mark(*d))
        .collect();
    if !base.is_empty() && base.is_ascii() {
        out.push_str(&base);
    } else {
        out.push(c);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_is_identity() {
        assert_eq!(normalize("Müller", false), "Müller");
    }

    #[test]
    fn test_umlauts_and_accents() {
        let cases = [
            ("Ýlang", "Ylang"),
            ("Müstèrmánn", "Muestermann"),
            ("Öle", "Oele"),
            ("Nînä", "Ninae"),
            ("Ǹanâ", "Nana"),
            ("Mästérfrâü", "Maesterfraue"),
            ("Straße", "Strasse"),
            ("Ærø", "Aeroe"),
        ];
        for (input, expected) in cases {
            assert_eq!(normalize(input, true), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_decomposed_input_is_composed_first() {
        assert_eq!(transliterate("Mu\u{308}ller"), "Mueller");
    }

    #[test]
    fn test_unmappable_characters_pass_through() {
        assert_eq!(transliterate("Άννα 李"), "Άννα 李");
        assert_eq!(transliterate("\u{301}x"), "\u{301}x");
    }

    #[test]
    fn test_idempotent() {
        for input in ["Müller", "Άννα", "Ǹanâ-Þór", "plain", "\u{301}", "ǅ"] {
            let once = transliterate(input);
            assert_eq!(transliterate(&once), once, "input {input:?}");
        }
    }
}
