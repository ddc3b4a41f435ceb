use thiserror::Error;

/// Why a string was rejected as an id.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("id is empty")]
    Empty,

    #[error("id has no '_' between prefix and ULID")]
    MissingSeparator,

    #[error("expected '{expected}_' prefix, found '{actual}_'")]
    InvalidPrefix {
        expected: &'static str,
        actual: String,
    },

    #[error("malformed ULID: {0}")]
    InvalidUlid(String),

    #[error("name is {len} characters long, limit is {max}")]
    TooLong { len: usize, max: usize },

    #[error("name contains {0:?}; allowed are ASCII letters, digits, '-', '_' and '.'")]
    InvalidCharacter(char),
}

impl IdError {
    pub fn is_empty(&self) -> bool {
        matches!(self, IdError::Empty)
    }
}
