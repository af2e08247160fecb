//! Archive file-name patterns.
//!
//! A pattern is a path with exactly one `%d{...}` date conversion, for example
//! `logs/app-%d{yyyy-MM-dd}.log.gz`. The date conversion decides the rollover
//! periodicity (its finest field) and the pattern suffix decides compression.
//! An optional `%i` renders the index of an archive within its period, as in
//! `%d{MM}.%i.txt.zip`.

use std::fmt;
use std::path::PathBuf;

use time::OffsetDateTime;

use crate::compress::CompressionMode;
use crate::{Error, Result};

const DEFAULT_DATE_FORMAT: &str = "yyyy-MM-dd";

/// Length of a rollover period, ordered from coarsest to finest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Periodicity {
    Yearly,
    Monthly,
    Daily,
    Hourly,
    Minutely,
    Secondly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DateToken {
    Year4,
    Year2,
    Month,
    Day,
    Hour,
    Minute,
    Second,
    Literal(String),
}

impl DateToken {
    fn periodicity(&self) -> Option<Periodicity> {
        match self {
            DateToken::Year4 | DateToken::Year2 => Some(Periodicity::Yearly),
            DateToken::Month => Some(Periodicity::Monthly),
            DateToken::Day => Some(Periodicity::Daily),
            DateToken::Hour => Some(Periodicity::Hourly),
            DateToken::Minute => Some(Periodicity::Minutely),
            DateToken::Second => Some(Periodicity::Secondly),
            DateToken::Literal(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Date(Vec<DateToken>),
    Index,
}

/// Parsed archive file-name pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNamePattern {
    raw: String,
    segments: Vec<Segment>,
    periodicity: Periodicity,
    compression: CompressionMode,
}

impl FileNamePattern {
    pub fn parse(raw: &str) -> Result<Self> {
        let segments = parse_segments(raw)?;

        let mut date_tokens = segments.iter().filter_map(|segment| match segment {
            Segment::Date(tokens) => Some(tokens),
            _ => None,
        });
        let tokens = date_tokens
            .next()
            .ok_or_else(|| Error::InvalidPattern(format!("missing %d in {raw}")))?;
        if date_tokens.next().is_some() {
            return Err(Error::InvalidPattern(format!(
                "more than one %d in {raw}"
            )));
        }
        let periodicity = tokens
            .iter()
            .filter_map(DateToken::periodicity)
            .max()
            .ok_or_else(|| Error::InvalidPattern(format!("%d in {raw} has no date fields")))?;
        let indexes = segments
            .iter()
            .filter(|segment| matches!(segment, Segment::Index))
            .count();
        if indexes > 1 {
            return Err(Error::InvalidPattern(format!(
                "more than one %i in {raw}"
            )));
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
            periodicity,
            compression: CompressionMode::from_file_name(raw),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn periodicity(&self) -> Periodicity {
        self.periodicity
    }

    pub fn compression(&self) -> CompressionMode {
        self.compression
    }

    /// Whether the pattern carries a `%i` index.
    pub fn has_index(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Index))
    }

    /// Render the archive path for the period containing `at`. `index` fills
    /// `%i` and is ignored by patterns without one.
    pub fn render(&self, at: OffsetDateTime, index: u32) -> PathBuf {
        PathBuf::from(self.render_string(at, index))
    }

    /// Render the path without the compression suffix (`.gz`, `.zip`).
    pub fn render_without_compression_suffix(&self, at: OffsetDateTime, index: u32) -> PathBuf {
        let rendered = self.render_string(at, index);
        let stripped = rendered
            .strip_suffix(self.compression.suffix())
            .unwrap_or(&rendered);
        PathBuf::from(stripped)
    }

    fn render_string(&self, at: OffsetDateTime, index: u32) -> String {
        let mut out = String::with_capacity(self.raw.len() + 8);
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Date(tokens) => {
                    for token in tokens {
                        render_token(&mut out, token, at);
                    }
                }
                Segment::Index => out.push_str(&index.to_string()),
            }
        }
        out
    }
}

impl fmt::Display for FileNamePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

fn render_token(out: &mut String, token: &DateToken, at: OffsetDateTime) {
    use std::fmt::Write;

    // Writing into a String cannot fail.
    let _ = match token {
        DateToken::Year4 => write!(out, "{:04}", at.year()),
        DateToken::Year2 => write!(out, "{:02}", at.year().rem_euclid(100)),
        DateToken::Month => write!(out, "{:02}", at.month() as u8),
        DateToken::Day => write!(out, "{:02}", at.day()),
        DateToken::Hour => write!(out, "{:02}", at.hour()),
        DateToken::Minute => write!(out, "{:02}", at.minute()),
        DateToken::Second => write!(out, "{:02}", at.second()),
        DateToken::Literal(text) => write!(out, "{text}"),
    };
}

fn parse_segments(raw: &str) -> Result<Vec<Segment>> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            literal.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => literal.push('%'),
            Some('i') => {
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Index);
            }
            Some('d') => {
                let format = if chars.peek() == Some(&'{') {
                    chars.next();
                    let mut format = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some(c) => format.push(c),
                            None => {
                                return Err(Error::InvalidPattern(format!(
                                    "unterminated %d{{ in {raw}"
                                )))
                            }
                        }
                    }
                    format
                } else {
                    DEFAULT_DATE_FORMAT.to_string()
                };
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Date(parse_date_format(&format)?));
            }
            Some(other) => {
                return Err(Error::InvalidPattern(format!(
                    "unsupported conversion %{other} in {raw}"
                )))
            }
            None => {
                return Err(Error::InvalidPattern(format!("dangling % in {raw}")));
            }
        }
    }

    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn parse_date_format(format: &str) -> Result<Vec<DateToken>> {
    let format = if format.trim().is_empty() {
        DEFAULT_DATE_FORMAT
    } else {
        format
    };
    let chars: Vec<char> = format.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c == '\'' {
            // Quoted literal; '' is an escaped quote.
            let mut text = String::new();
            i += 1;
            loop {
                match chars.get(i) {
                    Some('\'') if chars.get(i + 1) == Some(&'\'') => {
                        text.push('\'');
                        i += 2;
                    }
                    Some('\'') => {
                        i += 1;
                        break;
                    }
                    Some(&ch) => {
                        text.push(ch);
                        i += 1;
                    }
                    None => {
                        return Err(Error::InvalidPattern(format!(
                            "unterminated quote in date format {format}"
                        )))
                    }
                }
            }
            if text.is_empty() {
                text.push('\'');
            }
            tokens.push(DateToken::Literal(text));
            continue;
        }

        if !c.is_ascii_alphabetic() {
            tokens.push(DateToken::Literal(c.to_string()));
            i += 1;
            continue;
        }

        let run = chars[i..].iter().take_while(|&&ch| ch == c).count();
        let token = match (c, run) {
            ('y', 4) => DateToken::Year4,
            ('y', 2) => DateToken::Year2,
            ('M', 2) => DateToken::Month,
            ('d', 2) => DateToken::Day,
            ('H', 2) => DateToken::Hour,
            ('m', 2) => DateToken::Minute,
            ('s', 2) => DateToken::Second,
            _ => {
                let field: String = std::iter::repeat(c).take(run).collect();
                return Err(Error::InvalidPattern(format!(
                    "unsupported date field {field} in {format}"
                )));
            }
        };
        tokens.push(token);
        i += run;
    }

    Ok(tokens)
}
