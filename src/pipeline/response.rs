//! Reply parsing: pull the `latex` string out of a vision model's answer.
//!
//! Models are asked for `{"latex": "..."}` but routinely wrap it in code
//! fences, add a sentence before it, or write LaTeX backslashes unescaped
//! (`"\frac{a}{b}"`), which JSON reads as a form feed followed by `rac`.
//! The parser therefore:
//!
//! 1. trims and strips an outer ```` ``` ```` / ```` ```json ```` fence,
//! 2. takes the first `{` through the last `}`,
//! 3. parses it with lone backslashes inside strings doubled, then as-is,
//! 4. reads the `latex` field.
//!
//! The string is returned verbatim otherwise: no LaTeX is validated.

use crate::error::RecognitionError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static RE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z]*[ \t]*\n?(.*?)\n?```\s*$").unwrap());

/// Extract the recognised formula from a model reply.
///
/// `{"latex": ""}` and `{"latex": null}` mean "no formula" and yield an
/// empty string. Anything without a parseable object carrying a `latex`
/// field is a [`RecognitionError::MalformedResponse`].
pub fn extract_latex(content: &str) -> Result<String, RecognitionError> {
    let text = strip_fences(content.trim());
    if text.is_empty() {
        return Err(RecognitionError::MalformedResponse("empty content".into()));
    }

    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(s), Some(e)) if e > s => (s, e),
        _ => {
            return Err(RecognitionError::MalformedResponse(format!(
                "no JSON object in reply: {}",
                preview(text)
            )))
        }
    };
    let snippet = &text[start..=end];

    let object = serde_json::from_str::<Value>(&fix_latex_escapes(snippet))
        .ok()
        .filter(Value::is_object)
        .or_else(|| serde_json::from_str::<Value>(snippet).ok().filter(Value::is_object))
        .ok_or_else(|| {
            RecognitionError::MalformedResponse(format!("unparseable JSON: {}", preview(snippet)))
        })?;

    match object.get("latex") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Null) => Ok(String::new()),
        Some(other) => Err(RecognitionError::MalformedResponse(format!(
            "\"latex\" is not a string: {}",
            other
        ))),
        None => Err(RecognitionError::MalformedResponse(
            "reply object has no \"latex\" field".into(),
        )),
    }
}

fn strip_fences(text: &str) -> &str {
    match RE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(m) => m.as_str().trim(),
        None => text,
    }
}

/// Double every backslash inside JSON strings that does not already start
/// a valid escape of `"`, `\`, `/` or `\uXXXX`.
fn fix_latex_escapes(json: &str) -> String {
    let chars: Vec<char> = json.chars().collect();
    let mut out = String::with_capacity(json.len() + 8);
    let mut in_string = false;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if !in_string {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = false;
                out.push(c);
                i += 1;
            }
            '\\' => match chars.get(i + 1) {
                Some(&next) if matches!(next, '"' | '\\' | '/') => {
                    out.push('\\');
                    out.push(next);
                    i += 2;
                }
                Some(&'u') if is_unicode_escape(&chars[i + 2..]) => {
                    out.push('\\');
                    i += 1;
                }
                _ => {
                    out.push_str("\\\\");
                    i += 1;
                }
            },
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_unicode_escape(rest: &[char]) -> bool {
    rest.len() >= 4 && rest[..4].iter().all(|c| c.is_ascii_hexdigit())
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn well_formed_json() {
        assert_eq!(extract_latex(r#"{"latex": "x^2"}"#).unwrap(), "x^2");
    }

    #[test]
    fn properly_escaped_backslashes_are_kept() {
        let reply = r#"{"latex": "\\frac{a}{b} \\\\ \\alpha"}"#;
        assert_eq!(extract_latex(reply).unwrap(), r"\frac{a}{b} \\ \alpha");
    }

    #[test]
    fn raw_latex_backslashes_are_repaired() {
        // \f, \b, \t, \n and \r would otherwise be read as control characters.
        let reply = r#"{"latex": "\frac{\beta}{\text{n}} + \nu \rho"}"#;
        assert_eq!(extract_latex(reply).unwrap(), r"\frac{\beta}{\text{n}} + \nu \rho");
    }

    #[test]
    fn underline_is_not_a_unicode_escape() {
        let reply = r#"{"latex": "\underline{x}"}"#;
        assert_eq!(extract_latex(reply).unwrap(), r"\underline{x}");
    }

    #[test]
    fn real_unicode_escapes_survive() {
        assert_eq!(extract_latex(r#"{"latex": "\u00b0C"}"#).unwrap(), "°C");
    }

    #[test]
    fn fenced_reply() {
        let reply = "```json\n{\"latex\": \"E = mc^2\"}\n```";
        assert_eq!(extract_latex(reply).unwrap(), "E = mc^2");
    }

    #[test]
    fn prose_around_object() {
        let reply = "Here is the result:\n{\"latex\": \"a+b\"}\nHope this helps.";
        assert_eq!(extract_latex(reply).unwrap(), "a+b");
    }

    #[test]
    fn empty_and_null_latex_mean_no_formula() {
        assert_eq!(extract_latex(r#"{"latex": ""}"#).unwrap(), "");
        assert_eq!(extract_latex(r#"{"latex": null}"#).unwrap(), "");
    }

    #[test]
    fn malformed_replies() {
        for reply in ["", "   ", "no json here", "{not json}", r#"{"formula": "x"}"#, r#"{"latex": 3}"#] {
            assert!(
                matches!(extract_latex(reply), Err(RecognitionError::MalformedResponse(_))),
                "accepted {reply:?}"
            );
        }
    }

    #[test]
    fn preview_is_char_safe() {
        let long = "é".repeat(300);
        assert!(preview(&long).ends_with('…'));
    }
}
