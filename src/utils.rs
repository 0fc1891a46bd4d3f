// ABOUTME: Utility functions for identifier validation and SQL literal quoting
// ABOUTME: Guards every configured name and value that is spliced into generated SQL

use crate::error::{LayerError, Result};

/// Validate a MySQL identifier taken from configuration (table or column).
///
/// Dotted names (`schema.table`) are accepted; each segment must start with a
/// letter or underscore and contain only letters, digits, `_` or `$`, up to
/// MySQL's 64 character limit.
///
/// # Examples
///
/// ```
/// # use mysql_datalayer::utils::validate_mysql_identifier;
/// assert!(validate_mysql_identifier("product").is_ok());
/// assert!(validate_mysql_identifier("myapp.product_history").is_ok());
/// assert!(validate_mysql_identifier("123abc").is_err());
/// assert!(validate_mysql_identifier("product; DROP TABLE users").is_err());
/// ```
pub fn validate_mysql_identifier(identifier: &str) -> Result<()> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(LayerError::config(
            "identifier cannot be empty or whitespace-only",
        ));
    }

    for segment in trimmed.split('.') {
        if segment.len() > 64 {
            return Err(LayerError::config(format!(
                "identifier '{}' exceeds maximum length of 64 characters",
                sanitize_identifier(trimmed)
            )));
        }

        let mut chars = segment.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => {
                return Err(LayerError::config(format!(
                    "identifier '{}' must start each segment with a letter or underscore",
                    sanitize_identifier(trimmed)
                )))
            }
        }

        if let Some(bad) = chars.find(|c| !c.is_ascii_alphanumeric() && *c != '_' && *c != '$') {
            return Err(LayerError::config(format!(
                "identifier '{}' contains invalid character '{}'",
                sanitize_identifier(trimmed),
                if bad.is_control() {
                    format!("\\x{:02x}", bad as u32)
                } else {
                    bad.to_string()
                }
            )));
        }
    }

    Ok(())
}

/// Sanitize an identifier for display in errors and logs
///
/// ```
/// # use mysql_datalayer::utils::sanitize_identifier;
/// assert_eq!(sanitize_identifier("table\nname"), "tablename");
/// ```
pub fn sanitize_identifier(identifier: &str) -> String {
    identifier
        .chars()
        .filter(|c| !c.is_control())
        .take(100)
        .collect()
}

/// Quote a MySQL string literal
///
/// Doubles single quotes and escapes backslashes, which MySQL treats as an
/// escape character in its default SQL mode.
///
/// ```
/// use mysql_datalayer::utils::quote_literal;
/// assert_eq!(quote_literal("hello"), "'hello'");
/// assert_eq!(quote_literal("it's"), "'it''s'");
/// assert_eq!(quote_literal(r"a\b"), r"'a\\b'");
/// ```
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('\'');
    for ch in value.chars() {
        match ch {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('\'');
    quoted
}
