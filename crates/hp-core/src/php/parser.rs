//! Order-preserving parser for PHP-FPM pool files.
//!
//! Pool files are INI-style: `[section]` headers, `key = value` lines whose
//! keys may carry a bracketed index (`php_admin_value[memory_limit]`), and
//! comments starting with `;` or `#`. Unrecognised lines are kept verbatim so
//! edits never lose operator content.

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, line_ending, one_of, space0},
    combinator::opt,
    multi::many0,
    IResult,
};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum PoolParseError {
    #[error("Parse error: {0}")]
    Syntax(String),
    #[error("Unparsed content remaining: {0:?}")]
    Trailing(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PoolFile {
    pub entries: Vec<PoolLine>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PoolLine {
    /// `[name]`
    Section(String),
    KeyValue { key: String, value: String },
    /// Comment text including its leading `;` or `#`.
    Comment(String),
    Blank,
}

impl PoolFile {
    /// Name of the first section, which is the pool name.
    pub fn pool_name(&self) -> Option<&str> {
        self.entries.iter().find_map(|line| match line {
            PoolLine::Section(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.iter().find_map(|line| match line {
            PoolLine::KeyValue { key: k, value } if k == key => Some(value.as_str()),
            _ => None,
        })
    }

    /// Replace the first occurrence of `key`, or append it at the end.
    pub fn set(&mut self, key: &str, new_value: &str) {
        for line in &mut self.entries {
            if let PoolLine::KeyValue { key: k, value } = line {
                if k == key {
                    *value = new_value.to_string();
                    return;
                }
            }
        }
        self.entries.push(PoolLine::KeyValue {
            key: key.to_string(),
            value: new_value.to_string(),
        });
    }

    pub fn remove(&mut self, key: &str) {
        self.remove_where(|k| k == key);
    }

    /// Drop every key/value line whose key satisfies `pred`.
    pub fn remove_where<F>(&mut self, pred: F)
    where
        F: Fn(&str) -> bool,
    {
        self.entries.retain(|line| match line {
            PoolLine::KeyValue { key, .. } => !pred(key),
            _ => true,
        });
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|line| match line {
                PoolLine::KeyValue { key: k, value } if k == key => Some(value.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Keys starting with `prefix`, in file order.
    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|line| match line {
                PoolLine::KeyValue { key, .. } if key.starts_with(prefix) => Some(key.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn serialize(&self) -> String {
        let mut output = String::new();
        for line in &self.entries {
            match line {
                PoolLine::Section(name) => {
                    output.push('[');
                    output.push_str(name);
                    output.push_str("]\n");
                }
                PoolLine::KeyValue { key, value } => {
                    output.push_str(&format!("{} = {}\n", key, value));
                }
                PoolLine::Comment(c) => {
                    output.push_str(c);
                    output.push('\n');
                }
                PoolLine::Blank => output.push('\n'),
            }
        }
        output
    }
}

// nom parsers

fn is_not_newline(c: char) -> bool {
    c != '\n' && c != '\r'
}

fn comment_line(input: &str) -> IResult<&str, PoolLine> {
    let (input, _) = space0(input)?;
    let (input, marker) = one_of(";#")(input)?;
    let (input, rest) = take_while(is_not_newline)(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, PoolLine::Comment(format!("{}{}", marker, rest))))
}

fn blank_line(input: &str) -> IResult<&str, PoolLine> {
    let (input, _) = space0(input)?;
    let (input, _) = line_ending(input)?;
    Ok((input, PoolLine::Blank))
}

fn section_line(input: &str) -> IResult<&str, PoolLine> {
    let (input, _) = space0(input)?;
    let (input, _) = char('[')(input)?;
    let (input, name) = take_while1(|c: char| c != ']' && is_not_newline(c))(input)?;
    let (input, _) = char(']')(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((input, PoolLine::Section(name.trim().to_string())))
}

fn key_chars(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| {
        c.is_alphanumeric() || matches!(c, '_' | '-' | '.' | '[' | ']' | '/')
    })(input)
}

fn key_value_line(input: &str) -> IResult<&str, PoolLine> {
    let (input, _) = space0(input)?;
    let (input, key) = key_chars(input)?;
    let (input, _) = space0(input)?;
    let (input, _) = char('=')(input)?;
    let (input, _) = space0(input)?;
    let (input, val) = take_while(is_not_newline)(input)?;
    let (input, _) = opt(line_ending)(input)?;
    Ok((
        input,
        PoolLine::KeyValue {
            key: key.to_string(),
            value: val.trim_end().to_string(),
        },
    ))
}

fn pool_line(input: &str) -> IResult<&str, PoolLine> {
    alt((comment_line, blank_line, section_line, key_value_line))(input)
}

pub fn parse_pool(input: &str) -> Result<PoolFile, PoolParseError> {
    let (remaining, entries) =
        many0(pool_line)(input).map_err(|e| PoolParseError::Syntax(e.to_string()))?;

    if !remaining.trim().is_empty() {
        return Err(PoolParseError::Trailing(
            remaining.chars().take(100).collect(),
        ));
    }

    Ok(PoolFile { entries })
}
