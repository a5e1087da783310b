//! Plain-text views of a [`ParseResult`].

use crate::types::{ParseResult, TextElement, UnitContent};
use std::borrow::Cow;

fn is_zero_width(c: char) -> bool {
    matches!(c, '\u{200B}' | '\u{200C}' | '\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Trim, collapse whitespace runs to a single space and drop zero-width characters.
pub fn normalize_text(text: &str) -> Cow<'_, str> {
    let trimmed = text.trim_matches(|c: char| c.is_whitespace() || is_zero_width(c));
    let clean = !trimmed.chars().any(is_zero_width)
        && !trimmed
            .as_bytes()
            .windows(2)
            .any(|pair| pair[0].is_ascii_whitespace() && pair[1].is_ascii_whitespace())
        && !trimmed.chars().any(|c| c.is_whitespace() && c != ' ');
    if clean {
        return Cow::Borrowed(trimmed);
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_space = false;
    for c in trimmed.chars() {
        if is_zero_width(c) {
            continue;
        }
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !out.is_empty() {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    Cow::Owned(out)
}

/// Every non-empty text element, normalized, in unit order.
pub fn extract_texts(result: &ParseResult) -> Vec<String> {
    result
        .units
        .iter()
        .flat_map(|unit| unit.text_elements.iter())
        .map(|element| normalize_text(&element.text))
        .filter(|text| !text.is_empty())
        .map(Cow::into_owned)
        .collect()
}

/// Units with normalized text elements; empty elements are removed, positions kept.
pub fn text_with_positions(result: &ParseResult) -> Vec<UnitContent> {
    result
        .units
        .iter()
        .map(|unit| UnitContent {
            text_elements: unit
                .text_elements
                .iter()
                .filter_map(|element| {
                    let text = normalize_text(&element.text);
                    (!text.is_empty()).then(|| TextElement {
                        text: text.into_owned(),
                        ..element.clone()
                    })
                })
                .collect(),
            ..unit.clone()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DocumentMetadata, Position};

    fn element(text: &str) -> TextElement {
        TextElement {
            id: text.to_string(),
            text: text.to_string(),
            position: Some(Position {
                x: 1.0,
                y: 2.0,
                width: 3.0,
                height: 4.0,
            }),
            ..Default::default()
        }
    }

    fn sample() -> ParseResult {
        let units = vec![
            UnitContent {
                index: 0,
                text_elements: vec![element("  Quarterly\n\n  Review "), element("\u{200B}")],
                ..Default::default()
            },
            UnitContent::placeholder(1, Some("failed".to_string())),
            UnitContent {
                index: 2,
                text_elements: vec![element("Revenue\t+12%"), element("   ")],
                ..Default::default()
            },
        ];
        ParseResult::new("deck.pptx".to_string(), units, DocumentMetadata::default())
    }

    #[test]
    fn test_normalize_text() {
        assert_eq!(normalize_text("plain text"), "plain text");
        assert!(matches!(normalize_text("plain text"), Cow::Borrowed(_)));
        assert_eq!(normalize_text("  a \n\t b  "), "a b");
        assert_eq!(normalize_text("zero\u{200B}width"), "zerowidth");
        assert_eq!(normalize_text("\u{FEFF} lead"), "lead");
        assert_eq!(normalize_text(" \u{00A0} "), "");
    }

    #[test]
    fn test_extract_texts_drops_empties() {
        assert_eq!(extract_texts(&sample()), vec!["Quarterly Review", "Revenue +12%"]);
    }

    #[test]
    fn test_text_with_positions_keeps_alignment() {
        let units = text_with_positions(&sample());
        assert_eq!(units.len(), 3);
        assert_eq!(units[0].text_elements.len(), 1);
        assert_eq!(units[0].text_elements[0].text, "Quarterly Review");
        assert_eq!(units[0].text_elements[0].position.map(|p| p.width), Some(3.0));
        assert!(units[1].placeholder);
        assert!(units[1].text_elements.is_empty());
        assert_eq!(units[2].index, 2);
        assert_eq!(units[2].text_elements[0].text, "Revenue +12%");
    }
}
