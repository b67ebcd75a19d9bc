use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

/// Rule compilation failures. Both are fatal to the command that supplied
/// the rules, before any traversal starts.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A pattern did not compile, or a size or time value could not be parsed
    #[display("invalid value `{value}` for --{rule}")]
    InvalidPattern {
        #[error(not(source))]
        rule: String,
        #[error(not(source))]
        value: String,
    },
    #[display("unknown rule --{_0}")]
    UnknownRule(#[error(not(source))] String),
}
impl ErrorKind {
    pub(crate) fn invalid(rule: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidPattern {
            rule: rule.into(),
            value: value.into(),
        }
    }

    /// Compilation errors are deterministic; retrying never helps.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(ErrorKind::invalid("min-size", "ten").to_string(), "invalid value `ten` for --min-size");
        assert_eq!(ErrorKind::UnknownRule("colour".to_string()).to_string(), "unknown rule --colour");
    }
}
