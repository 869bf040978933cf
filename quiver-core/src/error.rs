use std::io;

/// Command-scoped error. Every variant is reported to the client as an error
/// reply and leaves the keyspace untouched.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{inner}")]
pub struct Error {
    pub inner: Inner,
}

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum Inner {
    #[error("ERR Protocol error: {message}")]
    ParserError { message: String, offset: usize },
    #[error("ERR syntax error")]
    Syntax,
    #[error("WRONGTYPE Operation against a key holding the wrong kind of value")]
    WrongType,
    #[error("ERR {message}")]
    OutOfRange { message: String },
    #[error("ERR wrong number of arguments for '{command}' command")]
    Arity { command: String },
    #[error("ERR unknown command '{name}'")]
    UnknownCommand { name: String },
}

impl Error {
    pub fn into_inner(&self) -> Inner {
        self.inner.clone()
    }

    pub fn syntax() -> Self {
        Error {
            inner: Inner::Syntax,
        }
    }

    pub fn wrong_type() -> Self {
        Error {
            inner: Inner::WrongType,
        }
    }

    pub fn not_an_integer() -> Self {
        Error {
            inner: Inner::OutOfRange {
                message: "value is not an integer or out of range".to_string(),
            },
        }
    }

    pub fn not_a_float() -> Self {
        Error {
            inner: Inner::OutOfRange {
                message: "value is not a valid float".to_string(),
            },
        }
    }

    pub fn string_too_long() -> Self {
        Error {
            inner: Inner::OutOfRange {
                message: "string exceeds maximum allowed size (512MB)".to_string(),
            },
        }
    }

    pub fn out_of_range(message: impl Into<String>) -> Self {
        Error {
            inner: Inner::OutOfRange {
                message: message.into(),
            },
        }
    }

    pub fn unknown_command(name: &[u8]) -> Self {
        Error {
            inner: Inner::UnknownCommand {
                name: String::from_utf8_lossy(name).into_owned(),
            },
        }
    }

    pub fn arity(command: &str) -> Self {
        Error {
            inner: Inner::Arity {
                command: command.to_lowercase(),
            },
        }
    }
}

impl From<Error> for io::Error {
    fn from(value: Error) -> Self {
        io::Error::other(value.to_string())
    }
}

/// Converts a error message to an Error with inner type ParserError.
#[macro_export]
macro_rules! parser_error {
    ($msg:expr, $offset:expr) => {
        Err($crate::Error {
            inner: $crate::Inner::ParserError {
                message: $msg.to_string(),
                offset: $offset,
            },
        })
    };
}

/// Converts a error message to a Error with inner type OutOfRange.
#[macro_export]
macro_rules! range_error {
    ($msg:literal) => {
        Err($crate::Error {
            inner: $crate::Inner::OutOfRange {
                message: $msg.to_string(),
            },
        })
    };
    ($msg:expr) => {
        Err($crate::Error {
            inner: $crate::Inner::OutOfRange { message: $msg },
        })
    };
}
