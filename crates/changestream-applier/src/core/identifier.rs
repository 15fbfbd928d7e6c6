//! Identifier validation and quoting for generated MySQL statements.
//!
//! Table and column names cannot be bound as statement parameters, so every
//! name taken from the schema catalog passes through [`quote_mysql`] before it
//! reaches SQL text. Names are validated first (no NUL bytes, bounded length)
//! and then wrapped in backticks with embedded backticks doubled.

use thiserror::Error;

/// MySQL limits identifiers to 64 characters.
pub const MAX_IDENTIFIER_LENGTH: usize = 64;

/// Why a name was refused as an identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("identifier cannot be empty")]
    Empty,

    #[error("identifier contains a null byte: {0:?}")]
    NullByte(String),

    #[error("identifier exceeds {max} characters (got {len}): {name:?}")]
    TooLong { name: String, len: usize, max: usize },
}

/// Validate an identifier.
pub fn validate_identifier(name: &str) -> Result<(), IdentifierError> {
    if name.is_empty() {
        return Err(IdentifierError::Empty);
    }
    if name.contains('\0') {
        return Err(IdentifierError::NullByte(name.to_string()));
    }
    let len = name.chars().count();
    if len > MAX_IDENTIFIER_LENGTH {
        return Err(IdentifierError::TooLong {
            name: name.to_string(),
            len,
            max: MAX_IDENTIFIER_LENGTH,
        });
    }
    Ok(())
}

/// Quote a MySQL identifier using backticks.
///
/// ```ignore
/// assert_eq!(quote_mysql("users")?, "`users`");
/// assert_eq!(quote_mysql("table`name")?, "`table``name`");
/// ```
pub fn quote_mysql(name: &str) -> Result<String, IdentifierError> {
    validate_identifier(name)?;
    Ok(format!("`{}`", name.replace('`', "``")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_identifier_valid() {
        assert!(validate_identifier("users").is_ok());
        assert!(validate_identifier("user_accounts").is_ok());
        assert!(validate_identifier("Users123").is_ok());
        assert!(validate_identifier("name with space").is_ok());
        assert!(validate_identifier("ñombre").is_ok());
    }

    #[test]
    fn test_validate_identifier_empty() {
        assert_eq!(validate_identifier(""), Err(IdentifierError::Empty));
    }

    #[test]
    fn test_validate_identifier_null_byte() {
        let result = validate_identifier("users\0; DROP TABLE users");
        assert!(matches!(result, Err(IdentifierError::NullByte(_))));
    }

    #[test]
    fn test_validate_identifier_too_long() {
        assert!(validate_identifier(&"a".repeat(64)).is_ok());
        let result = validate_identifier(&"a".repeat(65));
        assert!(matches!(
            result,
            Err(IdentifierError::TooLong { len: 65, max: 64, .. })
        ));
    }

    #[test]
    fn test_quote_mysql() {
        assert_eq!(quote_mysql("users").unwrap(), "`users`");
        assert_eq!(quote_mysql("table`name").unwrap(), "`table``name`");
        assert_eq!(quote_mysql("a``b").unwrap(), "`a````b`");
        assert!(quote_mysql("").is_err());
    }
}
