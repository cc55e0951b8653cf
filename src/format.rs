//! SQL text rendering for log output.

use crate::params::{ParamKey, ParameterSnapshot};

/// How statement text is rendered by [`TracingSink`](crate::TracingSink).
#[derive(Debug, Clone)]
pub struct SqlFormat {
    /// Substitute bound values for `?`, `$n` and `:name` placeholders.
    /// Default: `true`
    pub inline_parameters: bool,

    /// Write booleans as `true`/`false` instead of `1`/`0`.
    /// Default: `false`
    pub booleans_as_words: bool,

    /// Trim surrounding whitespace.
    /// Default: `true`
    pub trim: bool,

    /// Collapse runs of blank lines to one.
    /// Default: `true`
    pub collapse_blank_lines: bool,

    /// Terminate the statement with `;`.
    /// Default: `false`
    pub add_semicolon: bool,

    /// Wrap lines longer than this at whitespace. `0` disables wrapping.
    /// Default: `0`
    pub max_line_length: usize,
}

impl Default for SqlFormat {
    fn default() -> Self {
        Self {
            inline_parameters: true,
            booleans_as_words: false,
            trim: true,
            collapse_blank_lines: true,
            add_semicolon: false,
            max_line_length: 0,
        }
    }
}

impl SqlFormat {
    pub fn with_inline_parameters(mut self, enabled: bool) -> Self {
        self.inline_parameters = enabled;
        self
    }

    pub fn with_booleans_as_words(mut self, enabled: bool) -> Self {
        self.booleans_as_words = enabled;
        self
    }

    pub fn with_trim(mut self, enabled: bool) -> Self {
        self.trim = enabled;
        self
    }

    pub fn with_blank_line_collapsing(mut self, enabled: bool) -> Self {
        self.collapse_blank_lines = enabled;
        self
    }

    pub fn with_semicolon(mut self, enabled: bool) -> Self {
        self.add_semicolon = enabled;
        self
    }

    pub fn with_max_line_length(mut self, length: usize) -> Self {
        self.max_line_length = length;
        self
    }

    pub fn render(&self, sql: &str, parameters: &ParameterSnapshot) -> String {
        let mut text = if self.inline_parameters && !parameters.is_empty() {
            self.inline(sql, parameters)
        } else {
            sql.to_string()
        };
        if self.trim {
            text = text.trim().to_string();
        }
        if self.collapse_blank_lines {
            text = collapse_blank_lines(&text);
        }
        if self.add_semicolon && !text.trim_end().ends_with(';') {
            text.push(';');
        }
        if self.max_line_length > 0 {
            text = wrap(&text, self.max_line_length);
        }
        text
    }

    fn literal(&self, parameters: &ParameterSnapshot, key: &ParamKey) -> Option<String> {
        parameters
            .get(key)
            .map(|value| value.to_sql_literal(self.booleans_as_words))
    }

    /// Replace placeholders outside quoted sections. Unbound placeholders are
    /// left as written.
    fn inline(&self, sql: &str, parameters: &ParameterSnapshot) -> String {
        let chars: Vec<char> = sql.chars().collect();
        let mut out = String::with_capacity(sql.len() + parameters.len() * 8);
        let mut quote: Option<char> = None;
        let mut position = 0u32;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if let Some(q) = quote {
                out.push(c);
                if c == q {
                    quote = None;
                }
                i += 1;
                continue;
            }
            match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                    i += 1;
                }
                '?' => {
                    position += 1;
                    match self.literal(parameters, &ParamKey::Index(position)) {
                        Some(literal) => out.push_str(&literal),
                        None => out.push(c),
                    }
                    i += 1;
                }
                '$' if chars.get(i + 1).is_some_and(char::is_ascii_digit) => {
                    let end = scan(&chars, i + 1, |c| c.is_ascii_digit());
                    let digits: String = chars[i + 1..end].iter().collect();
                    let literal = digits
                        .parse::<u32>()
                        .ok()
                        .and_then(|n| self.literal(parameters, &ParamKey::Index(n)));
                    match literal {
                        Some(literal) => out.push_str(&literal),
                        None => out.extend(&chars[i..end]),
                    }
                    i = end;
                }
                ':' if chars.get(i + 1) == Some(&':') => {
                    // postgres cast
                    out.push_str("::");
                    i += 2;
                }
                ':' if chars
                    .get(i + 1)
                    .is_some_and(|c| c.is_ascii_alphabetic() || *c == '_') =>
                {
                    let end = scan(&chars, i + 1, |c| c.is_ascii_alphanumeric() || c == '_');
                    let name: String = chars[i + 1..end].iter().collect();
                    match self.literal(parameters, &ParamKey::Name(name)) {
                        Some(literal) => out.push_str(&literal),
                        None => out.extend(&chars[i..end]),
                    }
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }
        out
    }
}

fn scan(chars: &[char], start: usize, accept: impl Fn(char) -> bool) -> usize {
    chars[start..]
        .iter()
        .position(|c| !accept(*c))
        .map_or(chars.len(), |offset| start + offset)
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = Vec::new();
    let mut previous_blank = false;
    for line in text.lines() {
        let blank = line.trim().is_empty();
        if blank && previous_blank {
            continue;
        }
        previous_blank = blank;
        out.push(line);
    }
    out.join("\n")
}

fn wrap(text: &str, width: usize) -> String {
    let mut lines = Vec::new();
    for line in text.lines() {
        let mut current = String::new();
        for word in line.split_whitespace() {
            if !current.is_empty() && current.len() + 1 + word.len() > width {
                lines.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        lines.push(current);
    }
    lines.join("\n")
}
