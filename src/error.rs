use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Malformed(&'static str),
    UnknownMessageType(u32),
    Unimplemented(&'static str),
    ConfigSyntax(String),
    ConfigMissingKey { group: String, key: &'static str },
    Denied(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Malformed(msg) => write!(f, "malformed frame: {msg}"),
            Error::UnknownMessageType(t) => write!(f, "unknown message type: {t}"),
            Error::Unimplemented(what) => write!(f, "unimplemented: {what}"),
            Error::ConfigSyntax(msg) => write!(f, "config syntax error: {msg}"),
            Error::ConfigMissingKey { group, key } => {
                write!(f, "config group '{group}' missing required key '{key}'")
            }
            Error::Denied(msg) => write!(f, "denied: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
