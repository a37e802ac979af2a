//! Recovery of the `code` value from a streamed `{"code": "..."}` argument
//! string.
//!
//! While the model is still streaming, the argument string is usually cut off
//! somewhere inside the value. The extractor scans for the opening quote of
//! the value and returns whatever can be shown so far. Once the turn is
//! complete, the closing quote is located by scanning backwards from the final
//! brace. Neither path ever fails loudly: `None` means "nothing usable".

use serde_json::Value;

/// Extracts the `code` argument.
///
/// With `finished == false`, `None` means "not enough data yet". With
/// `finished == true`, `None` means the arguments are malformed.
pub fn extract_code(args: &str, finished: bool) -> Option<String> {
    let begin = find_value_start(args)?;

    if !finished {
        return extract_partial(args, begin);
    }

    match find_value_end(args) {
        Some(end) if end >= begin => {
            let slice = &args[begin..end];
            if slice.contains('\n') {
                Some(slice.trim_matches('\n').to_string())
            } else {
                decode_code(args)
            }
        }
        _ => decode_code(args),
    }
}

fn extract_partial(args: &str, begin: usize) -> Option<String> {
    let rest = &args[begin..];
    if rest.is_empty() {
        return Some(String::new());
    }
    if rest.contains('\n') {
        return Some(rest.trim_matches('\n').to_string());
    }
    decode_code(&format!("{args}\"}}"))
}

/// Byte index just past the opening quote of the value.
///
/// Tracks an opening brace, the quotes around the key and the colon after
/// it. The first quote after the colon opens the value.
fn find_value_start(args: &str) -> Option<usize> {
    let mut brace = false;
    let mut key_open = false;
    let mut key_closed = false;
    let mut colon = false;

    for (index, ch) in args.char_indices() {
        match ch {
            '{' => brace = true,
            '"' if brace => {
                if colon {
                    return Some(index + 1);
                } else if key_open {
                    key_closed = true;
                } else {
                    key_open = true;
                }
            }
            ':' if key_closed => colon = true,
            _ => {}
        }
    }
    None
}

/// Byte index of the quote that precedes the final closing brace
fn find_value_end(args: &str) -> Option<usize> {
    let mut brace = false;
    for (index, ch) in args.char_indices().rev() {
        match ch {
            '}' => brace = true,
            '"' if brace => return Some(index),
            _ => {}
        }
    }
    None
}

fn decode_code(json: &str) -> Option<String> {
    let value: Value = serde_json::from_str(json).ok()?;
    value.get("code")?.as_str().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_before_value_is_absent() {
        assert_eq!(extract_code("", false), None);
        assert_eq!(extract_code("{", false), None);
        assert_eq!(extract_code("{\"co", false), None);
        assert_eq!(extract_code("{\"code\"", false), None);
        assert_eq!(extract_code("{\"code\": ", false), None);
    }

    #[test]
    fn test_incomplete_with_empty_value() {
        assert_eq!(extract_code("{\"code\": \"", false), Some(String::new()));
    }

    #[test]
    fn test_incomplete_partial_value() {
        assert_eq!(
            extract_code("{\"code\": \"pri", false),
            Some("pri".to_string())
        );
        assert_eq!(
            extract_code("{\"code\": \"print(1)", false),
            Some("print(1)".to_string())
        );
    }

    #[test]
    fn test_incomplete_dangling_escape_is_not_ready() {
        assert_eq!(extract_code("{\"code\": \"print(\\", false), None);
        assert_eq!(
            extract_code("{\"code\": \"a\\n", false),
            Some("a\n".to_string())
        );
    }

    #[test]
    fn test_incomplete_with_raw_newline_returns_rest() {
        let args = "{\"code\": \"\nimport os\nprint(os.getcwd())";
        assert_eq!(
            extract_code(args, false),
            Some("import os\nprint(os.getcwd())".to_string())
        );
    }

    #[test]
    fn test_prefixes_grow_monotonically() {
        let value = "for i in range(3): print(i * 2)";
        let full = format!("{{\"code\": \"{value}\"}}");

        let mut last = String::new();
        for end in 0..full.len() {
            if let Some(extracted) = extract_code(&full[..end], false) {
                assert!(
                    value.starts_with(&extracted),
                    "{extracted:?} is not a prefix of {value:?}"
                );
                assert!(extracted.starts_with(&last));
                last = extracted;
            }
        }
        assert_eq!(last, value);
    }

    #[test]
    fn test_complete_round_trip() {
        for value in ["print(1)", "", "x = {'a': 1}", "print(\u{00e9}t\u{00e9})", "a: b"] {
            let args = format!("{{\"code\": \"{value}\"}}");
            assert_eq!(extract_code(&args, true).as_deref(), Some(value));
        }
    }

    #[test]
    fn test_complete_is_idempotent() {
        let args = "{\"code\": \"import math\\nprint(math.pi)\"}";
        let first = extract_code(args, true);
        assert_eq!(first, extract_code(args, true));
        assert_eq!(first.as_deref(), Some("import math\nprint(math.pi)"));
    }

    #[test]
    fn test_complete_with_raw_newlines_slices_between_quotes() {
        let args = "{\"code\": \"\nx = 1\nprint(x)\n\"}";
        assert_eq!(extract_code(args, true).as_deref(), Some("x = 1\nprint(x)"));

        let spaced = "{\n  \"code\": \"a = 1\nb = 2\"\n}";
        assert_eq!(extract_code(spaced, true).as_deref(), Some("a = 1\nb = 2"));
    }

    #[test]
    fn test_complete_escaped_quotes() {
        // Decoded through JSON when there is no raw newline
        let args = r#"{"code": "print(\"hi\")"}"#;
        assert_eq!(extract_code(args, true).as_deref(), Some("print(\"hi\")"));

        // A raw newline takes the slice path, which keeps escapes as written
        let raw = "{\"code\": \"print(\\\"a\\\")\nprint(2)\"}";
        assert_eq!(
            extract_code(raw, true).as_deref(),
            Some("print(\\\"a\\\")\nprint(2)")
        );
    }

    #[test]
    fn test_incomplete_escaped_quote_in_progress() {
        let args = r#"{"code": "print(\"hi"#;
        assert_eq!(extract_code(args, false).as_deref(), Some("print(\"hi"));
    }

    #[test]
    fn test_complete_malformed_is_absent() {
        assert_eq!(extract_code("{\"code\": \"print(1)", true), None);
        assert_eq!(extract_code("print(1)", true), None);
        assert_eq!(extract_code("{\"code\": 42}", true), None);
        assert_eq!(extract_code("{\"script\": \"x\"}", true), None);
    }

    #[test]
    fn test_multibyte_content() {
        let args = "{\"code\": \"print('\u{4f60}\u{597d} \u{1f600}')\"}";
        assert_eq!(
            extract_code(args, true).as_deref(),
            Some("print('\u{4f60}\u{597d} \u{1f600}')")
        );
        assert_eq!(
            extract_code("{\"code\": \"print('\u{4f60}", false).as_deref(),
            Some("print('\u{4f60}")
        );
    }
}
