// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for congestion engine operations.

use strum::IntoEnumIterator;
use strum_macros::EnumIter;

/// Congestion engine error.
#[derive(Clone, Debug, Default, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// There is no more work to do.
    #[default]
    Done,

    /// The configuration is invalid.
    InvalidConfig(String),

    /// The connection id does not refer to a registered connection.
    UnknownConnection(u64),

    /// A bounded resource (handover timer slots) is used up.
    ResourceExhausted,

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// I/O error.
    IoError(String),
}

impl Error {
    /// Whether the error leaves the connection usable.
    ///
    /// Only configuration and I/O errors are reported back to the caller as
    /// failures; the others describe conditions the engine degrades around.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::InvalidConfig(_) | Error::IoError(_))
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

impl std::convert::From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidConfig(format!("{}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_recoverable() {
        for err in Error::iter() {
            match err {
                Error::InvalidConfig(_) | Error::IoError(_) => assert!(!err.is_recoverable()),
                _ => assert!(err.is_recoverable()),
            }
        }
    }

    #[test]
    fn io_error() {
        use std::error::Error;
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let e = super::Error::from(e);

        assert_eq!(format!("{}", e), "IoError(\"unexpected end of file\")");
        assert!(e.source().is_none());
    }

    #[test]
    fn json_error() {
        let e = serde_json::from_str::<u32>("not a number").unwrap_err();
        let e = super::Error::from(e);
        assert!(matches!(e, super::Error::InvalidConfig(_)));
    }
}
