//! Array literal grammar (`{1,2,{"a b",NULL}}`).

use std::borrow::Cow;

use crate::error::{Error, Result};
use crate::value::Value;

/// Parse an array literal, decoding every non-NULL element with `element`.
///
/// Accepts the output of `array_out`: nested braces, double-quoted elements with
/// backslash escapes, unquoted `NULL`, and an optional `[lo:hi]=` dimension prefix.
pub fn parse_array<F>(text: &str, element: &F) -> Result<Value>
where
    F: Fn(&str) -> Result<Value>,
{
    let body = match text.strip_prefix('[') {
        Some(_) => {
            let eq = memchr::memchr(b'=', text.as_bytes())
                .ok_or_else(|| Error::Decode(format!("malformed array dimensions: {text}")))?;
            text.get(eq + 1..).unwrap_or_default()
        }
        None => text,
    };

    let mut parser = ArrayParser {
        input: body,
        pos: 0,
        element,
    };
    let items = parser.parse_items()?;
    parser.skip_whitespace();
    if parser.pos != body.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(Value::Array(items))
}

struct ArrayParser<'a, F> {
    input: &'a str,
    pos: usize,
    element: &'a F,
}

impl<'a, F> ArrayParser<'a, F>
where
    F: Fn(&str) -> Result<Value>,
{
    fn peek(&self) -> Option<u8> {
        self.input.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(|b| b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn error(&self, what: &str) -> Error {
        Error::Decode(format!(
            "malformed array literal at byte {}: {}: {}",
            self.pos, what, self.input
        ))
    }

    fn parse_items(&mut self) -> Result<Vec<Value>> {
        self.skip_whitespace();
        if self.bump() != Some(b'{') {
            return Err(self.error("expected '{'"));
        }

        let mut items = Vec::new();
        self.skip_whitespace();
        if self.peek() == Some(b'}') {
            self.pos += 1;
            return Ok(items);
        }

        loop {
            self.skip_whitespace();
            let item = match self.peek() {
                Some(b'{') => Value::Array(self.parse_items()?),
                Some(b'"') => {
                    let text = self.quoted()?;
                    (self.element)(&text)?
                }
                Some(_) => {
                    let text = self.unquoted()?;
                    if text.eq_ignore_ascii_case("NULL") {
                        Value::Null
                    } else {
                        (self.element)(&text)?
                    }
                }
                None => return Err(self.error("unexpected end")),
            };
            items.push(item);

            self.skip_whitespace();
            match self.bump() {
                Some(b',') => {}
                Some(b'}') => return Ok(items),
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
    }

    fn quoted(&mut self) -> Result<String> {
        // opening quote
        self.pos += 1;
        let mut out = Vec::new();
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(b'\\') => match self.bump() {
                    Some(b) => out.push(b),
                    None => return Err(self.error("dangling escape")),
                },
                Some(b) => out.push(b),
                None => return Err(self.error("unterminated quoted element")),
            }
        }
        String::from_utf8(out).map_err(|e| Error::Decode(format!("invalid UTF-8 in array: {e}")))
    }

    fn unquoted(&mut self) -> Result<Cow<'a, str>> {
        let start = self.pos;
        let mut escaped = false;
        while let Some(b) = self.peek() {
            match b {
                b',' | b'}' => break,
                b'\\' => {
                    escaped = true;
                    let next = self
                        .input
                        .get(self.pos + 1..)
                        .and_then(|rest| rest.chars().next())
                        .ok_or_else(|| self.error("dangling escape"))?;
                    self.pos += 1 + next.len_utf8();
                }
                _ => self.pos += 1,
            }
        }
        let raw = self
            .input
            .get(start..self.pos)
            .ok_or_else(|| self.error("unterminated element"))?
            .trim_end();
        if raw.is_empty() {
            return Err(self.error("empty element"));
        }
        if !escaped {
            return Ok(Cow::Borrowed(raw));
        }

        let mut out = String::with_capacity(raw.len());
        let mut chars = raw.chars();
        while let Some(c) = chars.next() {
            if c == '\\' {
                if let Some(next) = chars.next() {
                    out.push(next);
                }
            } else {
                out.push(c);
            }
        }
        Ok(Cow::Owned(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Result<Value> {
        Ok(Value::Text(s.to_string()))
    }

    fn int(s: &str) -> Result<Value> {
        s.parse::<i64>()
            .map(Value::Int)
            .map_err(|e| Error::Decode(e.to_string()))
    }

    #[test]
    fn flat_and_empty() {
        assert_eq!(parse_array("{}", &text).ok(), Some(Value::Array(vec![])));
        assert_eq!(
            parse_array("{1,2,3}", &int).ok(),
            Some(Value::from(vec![1, 2, 3]))
        );
    }

    #[test]
    fn nested_with_nulls() {
        assert_eq!(
            parse_array("{{1,NULL},{3,4}}", &int).ok(),
            Some(Value::from(vec![vec![Some(1), None], vec![Some(3), Some(4)]]))
        );
    }

    #[test]
    fn quoted_elements_are_unescaped() {
        let parsed = parse_array(
            r#"{"tricky,,{}}{\"\\string",NULL,simpleString,"NULL","",",","\\","\""}"#,
            &text,
        );
        assert_eq!(
            parsed.ok(),
            Some(Value::Array(vec![
                Value::from("tricky,,{}}{\"\\string"),
                Value::Null,
                Value::from("simpleString"),
                Value::from("NULL"),
                Value::from(""),
                Value::from(","),
                Value::from("\\"),
                Value::from("\""),
            ]))
        );
    }

    #[test]
    fn multibyte_text() {
        assert_eq!(
            parse_array(r#"{"héllo wörld",日本}"#, &text).ok(),
            Some(Value::from(vec!["héllo wörld", "日本"]))
        );
    }

    #[test]
    fn escaped_multibyte_in_unquoted_element() {
        assert_eq!(
            parse_array(r"{\é,a\日b,\\}", &text).ok(),
            Some(Value::from(vec!["é", "a日b", "\\"]))
        );
        assert!(parse_array(r"{a\", &text).is_err());
    }

    #[test]
    fn dimension_prefix() {
        assert_eq!(
            parse_array("[0:1]={7,8}", &int).ok(),
            Some(Value::from(vec![7, 8]))
        );
    }

    #[test]
    fn malformed() {
        assert!(parse_array("{1,2", &int).is_err());
        assert!(parse_array("1,2}", &int).is_err());
        assert!(parse_array("{1,,2}", &int).is_err());
        assert!(parse_array("{\"abc}", &text).is_err());
    }
}
