use derive_more::{Display, Error};

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error: {_0}")]
    Config(#[error(not(source))] String),
    #[display("unable to open profile `{_0}`")]
    Backend(#[error(not(source))] String),
    #[display("invalid rule: {_0}")]
    Rules(#[error(not(source))] String),
    /// Command-line arguments that parsed but make no sense together
    #[display("{_0}")]
    Usage(#[error(not(source))] String),
    #[display("{name}: {reason}")]
    Command { name: &'static str, reason: String },
    #[display("unable to write output")]
    Output,
}
