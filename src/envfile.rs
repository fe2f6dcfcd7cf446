//! Parsing decrypted environment files into `NAME=VALUE` entries.
//!
//! The envfile format is parsed tolerantly: blank lines, `#` comments and lines that
//! are not `NAME=VALUE` are dropped and parsing carries on. Entries keep file order
//! and duplicates are kept; consumers decide how to resolve them.
//!
//! # Supported Formats
//!
//! - `envfile` (default): one `NAME=VALUE` per line
//! - `json`: a flat object of string values
//! - `yaml`: a flat mapping of string values

use crate::error::{Error, Result};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;
use tracing::debug;

static ENTRY_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([A-Za-z][0-9A-Za-z_]*)=(.*)$").expect("valid regex"));

static VARIABLE_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][0-9A-Za-z_]*$").expect("valid regex"));

/// Content type of the decrypted file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Envfile,
    Json,
    Yaml,
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContentType::Envfile => "envfile",
            ContentType::Json => "json",
            ContentType::Yaml => "yaml",
        };
        f.write_str(name)
    }
}

/// One environment variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub name: String,
    pub value: String,
}

impl EnvEntry {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for EnvEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

/// Whether a trimmed line is a well-formed `NAME=VALUE` entry.
pub fn is_entry_line(line: &str) -> bool {
    ENTRY_LINE.is_match(line)
}

/// Whether `name` may be used as an environment variable name.
pub fn is_valid_name(name: &str) -> bool {
    VARIABLE_NAME.is_match(name)
}

/// Split an entry line on its first `=`.
///
/// Everything after the first `=`, further `=` included, is the value.
pub fn split_entry(line: &str) -> Option<(&str, &str)> {
    line.split_once('=')
}

/// Wrap `value` in single quotes so a POSIX shell reads it literally.
///
/// ```
/// use secure_environment::envfile::shell_quote;
///
/// assert_eq!(shell_quote("it's"), r#"'it'"'"'s'"#);
/// ```
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r#"'"'"'"#))
}

/// Parse decrypted plaintext of the given content type.
///
/// With `escape` set, every value is rendered with [`shell_quote`].
///
/// # Errors
///
/// Envfile parsing never fails. JSON and YAML input that is not a flat map of
/// strings is rejected with [`Error::InvalidContent`].
pub fn parse(content_type: ContentType, text: &str, escape: bool) -> Result<Vec<EnvEntry>> {
    let entries = match content_type {
        ContentType::Envfile => parse_envfile(text),
        ContentType::Json => parse_json(text)?,
        ContentType::Yaml => parse_yaml(text)?,
    };

    if !escape {
        return Ok(entries);
    }

    Ok(entries
        .into_iter()
        .map(|entry| EnvEntry {
            value: shell_quote(&entry.value),
            name: entry.name,
        })
        .collect())
}

/// Parse the `NAME=VALUE` line format.
pub fn parse_envfile(text: &str) -> Vec<EnvEntry> {
    let mut entries = Vec::new();

    for (line_number, line) in text.split('\n').enumerate() {
        let line = line.trim();

        if line.is_empty() {
            debug!("Empty line: {}", line_number);
            continue;
        }
        if !is_entry_line(line) {
            // Content is not logged, the line may hold a secret
            debug!("Invalid line: {}", line_number);
            continue;
        }
        if line.starts_with('#') {
            debug!("Comment line: {}", line_number);
            continue;
        }

        if let Some((name, value)) = split_entry(line) {
            entries.push(EnvEntry::new(name, value));
        }
    }

    entries
}

fn parse_json(text: &str) -> Result<Vec<EnvEntry>> {
    let json: serde_json::Value = serde_json::from_str(text).map_err(|e| invalid("json", e))?;

    let object = json
        .as_object()
        .ok_or_else(|| invalid("json", "expected an object of key-value pairs"))?;

    let mut entries = Vec::new();
    for (name, value) in object {
        let value = value.as_str().ok_or_else(|| {
            invalid("json", format!("value for key '{}' must be a string", name))
        })?;
        push_named(&mut entries, name, value);
    }

    Ok(entries)
}

fn parse_yaml(text: &str) -> Result<Vec<EnvEntry>> {
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }

    let yaml: serde_yaml::Value = serde_yaml::from_str(text).map_err(|e| invalid("yaml", e))?;

    let mapping = yaml
        .as_mapping()
        .ok_or_else(|| invalid("yaml", "expected a mapping of key-value pairs"))?;

    let mut entries = Vec::new();
    for (name, value) in mapping {
        let name = name
            .as_str()
            .ok_or_else(|| invalid("yaml", "keys must be strings"))?;
        let value = value.as_str().ok_or_else(|| {
            invalid("yaml", format!("value for key '{}' must be a string", name))
        })?;
        push_named(&mut entries, name, value);
    }

    Ok(entries)
}

fn push_named(entries: &mut Vec<EnvEntry>, name: &str, value: &str) {
    if is_valid_name(name) {
        entries.push(EnvEntry::new(name, value));
    } else {
        debug!("Invalid variable name skipped at position {}", entries.len());
    }
}

fn invalid(format: &str, message: impl fmt::Display) -> Error {
    Error::InvalidContent {
        format: format.to_string(),
        message: message.to_string(),
    }
}
