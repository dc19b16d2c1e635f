// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// MySQL error numbers the connection layer distinguishes.
pub mod errno {
    /// First client-side error number.
    pub const CR_UNKNOWN_ERROR: u16 = 2000;
    pub const CR_CONNECTION_ERROR: u16 = 2002;
    pub const CR_SERVER_GONE: u16 = 2006;
    pub const CR_SERVER_HANDSHAKE_ERR: u16 = 2012;
    /// Lost connection to the server during a query. Usually the result of a
    /// kill.
    pub const CR_SERVER_LOST: u16 = 2013;
    /// Last client-side error number that describes a broken connection.
    pub const CR_NAMED_PIPE_STATE_ERROR: u16 = 2018;
    pub const ER_UNKNOWN_ERROR: u16 = 1105;
    pub const ER_QUERY_INTERRUPTED: u16 = 1317;
    pub const ER_QUERY_TIMEOUT: u16 = 3024;
}

/// Canonical error codes, in the style of gRPC status codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    Ok,
    Canceled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl ErrorCode {
    /// The severity of the code when several errors are folded into one.
    /// Higher wins.
    pub fn priority(self) -> u8 {
        match self {
            ErrorCode::Ok => 0,
            ErrorCode::Canceled => 1,
            ErrorCode::AlreadyExists => 2,
            ErrorCode::OutOfRange => 3,
            ErrorCode::Unavailable => 4,
            ErrorCode::DeadlineExceeded => 5,
            ErrorCode::Aborted => 6,
            ErrorCode::FailedPrecondition => 7,
            ErrorCode::ResourceExhausted => 8,
            ErrorCode::Unknown => 9,
            ErrorCode::Unauthenticated => 10,
            ErrorCode::PermissionDenied => 11,
            ErrorCode::InvalidArgument => 12,
            ErrorCode::NotFound => 13,
            ErrorCode::Unimplemented => 14,
            ErrorCode::Internal => 15,
            ErrorCode::DataLoss => 16,
        }
    }

    /// Maps a MySQL error number onto a canonical code.
    pub fn from_errno(num: u16) -> ErrorCode {
        match num {
            errno::ER_QUERY_INTERRUPTED => ErrorCode::Canceled,
            errno::ER_QUERY_TIMEOUT => ErrorCode::DeadlineExceeded,
            errno::CR_UNKNOWN_ERROR..=errno::CR_NAMED_PIPE_STATE_ERROR => ErrorCode::Unavailable,
            _ => ErrorCode::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Canceled => "CANCELED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::OutOfRange => "OUT_OF_RANGE",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::DataLoss => "DATA_LOSS",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error produced by a database session, or by the layers above it on
/// behalf of one.
///
/// Errors that originate from the MySQL protocol carry the server or client
/// error number and SQL state, and render as `<message> (errno N) (sqlstate
/// S)`. All other errors render as their bare message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SqlError {
    pub code: ErrorCode,
    pub errno: Option<u16>,
    pub sql_state: Option<String>,
    pub message: String,
}

impl SqlError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> SqlError {
        SqlError {
            code,
            errno: None,
            sql_state: None,
            message: message.into(),
        }
    }

    /// An error reported through the MySQL protocol.
    pub fn mysql(num: u16, sql_state: &str, message: impl Into<String>) -> SqlError {
        SqlError {
            code: ErrorCode::from_errno(num),
            errno: Some(num),
            sql_state: Some(sql_state.into()),
            message: message.into(),
        }
    }

    /// Reports whether the error means the client lost its connection before
    /// the server could have acted on the statement. Such statements are safe
    /// to retry on a fresh connection.
    ///
    /// A connection lost *during* a query is excluded: the query may have
    /// been killed on purpose, and its side effects are unknown.
    pub fn is_conn_err(&self) -> bool {
        match self.errno {
            Some(num) => {
                (errno::CR_UNKNOWN_ERROR..=errno::CR_NAMED_PIPE_STATE_ERROR).contains(&num)
                    && num != errno::CR_SERVER_LOST
            }
            None => false,
        }
    }

    pub fn is_conn_lost_during_query(&self) -> bool {
        self.errno == Some(errno::CR_SERVER_LOST)
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.message)?;
        if let Some(num) = self.errno {
            write!(f, " (errno {num})")?;
            if let Some(state) = &self.sql_state {
                write!(f, " (sqlstate {state})")?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for SqlError {}

/// Access to the canonical code of an error that may wrap a [`SqlError`].
pub trait HasErrorCode {
    fn error_code(&self) -> ErrorCode;
}

impl HasErrorCode for SqlError {
    fn error_code(&self) -> ErrorCode {
        self.code
    }
}

/// Folds a list of errors into one.
///
/// The code is the highest-priority code in the list, the earliest error
/// winning ties. The message is every error's display string, one per line,
/// in list order. Returns `None` for an empty list.
pub fn aggregate<E>(errors: &[E]) -> Option<SqlError>
where
    E: HasErrorCode + fmt::Display,
{
    let mut top = errors.first()?.error_code();
    for err in &errors[1..] {
        let code = err.error_code();
        if code.priority() > top.priority() {
            top = code;
        }
    }
    Some(SqlError::new(top, errors.iter().join("\n")))
}
