use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// A configuration source could not be read or parsed
    #[display("unable to load configuration")]
    Load,
    #[display("unknown profile `{_0}`")]
    UnknownProfile(#[error(not(source))] String),
    /// The configuration parsed but holds an unusable value
    #[display("invalid configuration: {_0}")]
    Invalid(#[error(not(source))] String),
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
