//! Identifier and literal handling for statements that cannot be fully
//! parameter-bound (DDL, generated UPDATEs).
//!
//! Every table or column name spliced into SQL goes through
//! [`quote_identifier`], which first checks the name against an allow-list
//! (ASCII letters, digits, underscore) and then quotes it.

use crate::core::{Result, TdmError};
use lazy_static::lazy_static;
use regex::Regex;

pub const MAX_IDENTIFIER_LEN: usize = 63;

/// Names SQLite resolves to the implicit row key when not shadowed.
const RESERVED_ROW_ALIASES: [&str; 3] = ["rowid", "oid", "_rowid_"];

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z0-9_]+$").expect("static regex");
}

pub fn validate_identifier(name: &str) -> Result<&str> {
    if name.is_empty() {
        return Err(TdmError::Validation("identifier cannot be empty".into()));
    }
    if name.len() > MAX_IDENTIFIER_LEN {
        return Err(TdmError::Validation(format!(
            "identifier '{}' is longer than {} characters",
            name, MAX_IDENTIFIER_LEN
        )));
    }
    if !IDENTIFIER.is_match(name) {
        return Err(TdmError::Validation(format!(
            "identifier '{}' may contain only letters, digits and underscore",
            name
        )));
    }
    if RESERVED_ROW_ALIASES
        .iter()
        .any(|alias| alias.eq_ignore_ascii_case(name))
    {
        return Err(TdmError::Validation(format!(
            "identifier '{}' is reserved",
            name
        )));
    }
    Ok(name)
}

/// Validate and double-quote an identifier.
pub fn quote_identifier(name: &str) -> Result<String> {
    let name = validate_identifier(name)?;
    Ok(format!("\"{}\"", name.replace('"', "\"\"")))
}

/// Encode a string as a single-quoted SQL literal.
pub fn encode_literal(value: &str) -> Result<String> {
    if value.contains('\0') {
        return Err(TdmError::Validation(
            "literal values cannot contain NUL characters".into(),
        ));
    }
    Ok(format!("'{}'", value.replace('\'', "''")))
}

/// Escape `LIKE` wildcards so a value matches literally; pair with `ESCAPE '\'`.
pub fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}
