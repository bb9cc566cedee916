//! Results file header: rendering, parsing and value escaping.
//!
//! ```text
//! #<free comment>
//! #Procedure: <RandomProcedure>
//! #Parameters:
//! #	Loop Iterations: 10
//! #	Delay Time: 0.0 s
//! #Metadata:
//! #	Start Time: 2026-01-01T00:00:00+00:00
//! Iteration,Random Number
//! ```
//!
//! Values are escaped so that control characters never break line-based parsing.

use crate::procedures::ProcedureInstance;
use once_cell::sync::Lazy;
use regex::Regex;

pub(crate) const PROCEDURE_PREFIX: &str = "Procedure: ";
pub(crate) const PARAMETERS_LINE: &str = "Parameters:";
pub(crate) const METADATA_LINE: &str = "Metadata:";

static PROCEDURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^Procedure: <(.*)>$").expect("valid regex"));

/// Escapes backslashes and control characters.
pub fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => out.push_str(&format!("\\x{:02x}", u32::from(c))),
            c => out.push(c),
        }
    }
    out
}

/// Inverse of [`escape`]. Unknown escapes are kept verbatim.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                match u32::from_str_radix(&hex, 16).ok().and_then(char::from_u32) {
                    Some(c) if hex.len() == 2 => out.push(c),
                    _ => {
                        out.push_str("\\x");
                        out.push_str(&hex);
                    }
                }
            }
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

fn entry_line(comment: char, name: &str, value: &str) -> String {
    format!("{comment}\t{name}: {}", escape(value))
}

/// Comment block up to and including the parameters, one string per line.
pub fn render_header(procedure: &ProcedureInstance, comments: &[String], comment: char) -> Vec<String> {
    let mut lines = Vec::with_capacity(comments.len() + procedure.parameters().len() + 2);
    for text in comments {
        for line in text.lines() {
            lines.push(format!("{comment}{line}"));
        }
    }
    lines.push(format!("{comment}{PROCEDURE_PREFIX}<{}>", procedure.type_id()));
    lines.push(format!("{comment}{PARAMETERS_LINE}"));
    for parameter in procedure.parameters().iter() {
        lines.push(entry_line(comment, parameter.name(), &parameter.value_string()));
    }
    lines
}

/// Metadata block spliced in after `startup()`.
pub fn render_metadata(procedure: &ProcedureInstance, comment: char) -> Vec<String> {
    let mut lines = Vec::with_capacity(procedure.metadata().len() + 1);
    lines.push(format!("{comment}{METADATA_LINE}"));
    for entry in procedure.metadata().iter() {
        lines.push(entry_line(comment, entry.name(), &entry.value_string()));
    }
    lines
}

/// Contents of a parsed header.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedHeader {
    pub procedure_type: Option<String>,
    pub comments: Vec<String>,
    pub parameters: Vec<(String, String)>,
    pub metadata: Vec<(String, String)>,
}

impl ParsedHeader {
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn has_metadata_block(&self) -> bool {
        !self.metadata.is_empty()
    }
}

#[derive(Clone, Copy)]
enum Section {
    Comments,
    Parameters,
    Metadata,
}

/// Parses header lines with the comment character already stripped.
pub fn parse_header<S: AsRef<str>>(lines: &[S]) -> ParsedHeader {
    let mut parsed = ParsedHeader::default();
    let mut section = Section::Comments;

    for line in lines {
        let line = line.as_ref();
        if let Some(caps) = PROCEDURE_RE.captures(line) {
            parsed.procedure_type = caps.get(1).map(|m| m.as_str().to_string());
            continue;
        }
        match line {
            PARAMETERS_LINE => {
                section = Section::Parameters;
                continue;
            }
            METADATA_LINE => {
                section = Section::Metadata;
                continue;
            }
            _ => {}
        }
        let entry = line
            .strip_prefix('\t')
            .and_then(|rest| rest.split_once(": ").or_else(|| rest.strip_suffix(':').map(|n| (n, ""))));
        match (section, entry) {
            (Section::Parameters, Some((name, value))) => {
                parsed.parameters.push((name.to_string(), unescape(value)));
            }
            (Section::Metadata, Some((name, value))) => {
                parsed.metadata.push((name.to_string(), unescape(value)));
            }
            _ => parsed.comments.push(line.to_string()),
        }
    }
    parsed
}
