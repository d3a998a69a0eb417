//! Field extraction from incomplete JSON tool-call payloads.
//!
//! The agent streams tool inputs a few bytes at a time, so the object is
//! usually not yet parseable when the file path becomes visible. These
//! helpers scan the raw text for a string-valued key instead of parsing it.
//! Malformed input yields `None`; nothing here panics.

/// Key carrying the target path of file-writing tools.
pub const FILE_PATH_KEY: &str = "file_path";

/// A string value found in a fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValue {
    pub value: String,
    /// `false` when the closing quote has not been streamed yet and the value
    /// runs to the end of the input.
    pub complete: bool,
}

/// Return the `"file_path"` value of a possibly-unterminated JSON object.
pub fn try_extract_file_path_from_partial(fragment: &str) -> Option<String> {
    extract_string_field(fragment, FILE_PATH_KEY).map(|field| field.value)
}

/// Find the first string value stored under `key` in an object-shaped
/// fragment. A dangling trailing value is returned with `complete = false`.
pub fn extract_string_field(fragment: &str, key: &str) -> Option<FieldValue> {
    if !fragment.trim_start().starts_with('{') {
        return None;
    }

    let mut scanner = Scanner::new(fragment);
    while let Some(token) = scanner.next_string() {
        if !token.complete {
            return None;
        }
        if token.value != key {
            continue;
        }
        scanner.skip_whitespace();
        if !scanner.eat(':') {
            // A string value that happens to equal the key
            continue;
        }
        scanner.skip_whitespace();
        if scanner.peek() != Some('"') {
            return None;
        }
        let value = scanner.next_string()?;
        if value.value.is_empty() {
            return None;
        }
        return Some(value);
    }
    None
}

struct Scanner<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Scanner<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn eat(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.chars.next();
        }
    }

    /// Advance to the next string literal and decode it.
    fn next_string(&mut self) -> Option<FieldValue> {
        loop {
            match self.chars.next()? {
                '"' => break,
                _ => continue,
            }
        }

        let mut value = String::new();
        loop {
            let Some(c) = self.chars.next() else {
                return Some(FieldValue {
                    value,
                    complete: false,
                });
            };
            match c {
                '"' => {
                    return Some(FieldValue {
                        value,
                        complete: true,
                    });
                }
                '\\' => match self.chars.next() {
                    Some('n') => value.push('\n'),
                    Some('t') => value.push('\t'),
                    Some('r') => value.push('\r'),
                    Some('b') => value.push('\u{8}'),
                    Some('f') => value.push('\u{c}'),
                    Some('u') => {
                        let hex: String = self.chars.by_ref().take(4).collect();
                        if hex.len() < 4 {
                            // Escape cut off mid-stream
                            return Some(FieldValue {
                                value,
                                complete: false,
                            });
                        }
                        let decoded = u32::from_str_radix(&hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .unwrap_or(char::REPLACEMENT_CHARACTER);
                        value.push(decoded);
                    }
                    Some(other) => value.push(other),
                    None => {
                        return Some(FieldValue {
                            value,
                            complete: false,
                        });
                    }
                },
                other => value.push(other),
            }
        }
    }
}
