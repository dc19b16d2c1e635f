// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeMap;
use std::fmt::{self, Write};

use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, SqlError};

/// The type of a [`Value`], as reported in result [`Field`](crate::Field)s.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueType {
    Null,
    Int64,
    Uint64,
    Float64,
    VarChar,
    VarBinary,
}

/// A single SQL value: a cell of a result row or a bind variable.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Int64(i64),
    Uint64(u64),
    Float64(f64),
    VarChar(String),
    VarBinary(Vec<u8>),
}

impl Value {
    pub fn typ(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Int64(_) => ValueType::Int64,
            Value::Uint64(_) => ValueType::Uint64,
            Value::Float64(_) => ValueType::Float64,
            Value::VarChar(_) => ValueType::VarChar,
            Value::VarBinary(_) => ValueType::VarBinary,
        }
    }

    /// Writes the value as a SQL literal.
    ///
    /// NaN and infinite floats have no literal form and are rejected.
    pub fn encode_sql(&self, buf: &mut String) -> Result<(), SqlError> {
        match self {
            Value::Null => buf.push_str("null"),
            Value::Int64(i) => write!(buf, "{i}").expect("writing to string cannot fail"),
            Value::Uint64(u) => write!(buf, "{u}").expect("writing to string cannot fail"),
            Value::Float64(f) if !f.is_finite() => {
                return Err(SqlError::new(
                    ErrorCode::InvalidArgument,
                    format!("cannot encode {f} as a SQL literal"),
                ));
            }
            Value::Float64(f) => write!(buf, "{f:?}").expect("writing to string cannot fail"),
            Value::VarChar(s) => {
                buf.push('\'');
                for c in s.chars() {
                    match c {
                        '\0' => buf.push_str("\\0"),
                        '\n' => buf.push_str("\\n"),
                        '\r' => buf.push_str("\\r"),
                        '\\' => buf.push_str("\\\\"),
                        '\'' => buf.push_str("\\'"),
                        '"' => buf.push_str("\\\""),
                        '\x1a' => buf.push_str("\\Z"),
                        c => buf.push(c),
                    }
                }
                buf.push('\'');
            }
            Value::VarBinary(bytes) => {
                buf.push_str("X'");
                for b in bytes {
                    write!(buf, "{b:02X}").expect("writing to string cannot fail");
                }
                buf.push('\'');
            }
        }
        Ok(())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut buf = String::new();
        match self.encode_sql(&mut buf) {
            Ok(()) => f.write_str(&buf),
            Err(_) => write!(f, "{self:?}"),
        }
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Value {
        Value::Int64(i)
    }
}

impl From<u64> for Value {
    fn from(u: u64) -> Value {
        Value::Uint64(u)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::VarChar(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::VarChar(s)
    }
}

pub type BindVariables = BTreeMap<String, Value>;

/// SQL text plus the values for its `:name` placeholders.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundQuery {
    pub sql: String,
    pub bind_variables: BindVariables,
}

impl BoundQuery {
    pub fn new(sql: impl Into<String>) -> BoundQuery {
        BoundQuery {
            sql: sql.into(),
            bind_variables: BindVariables::new(),
        }
    }

    pub fn with_bind_variables(sql: impl Into<String>, bind_variables: BindVariables) -> BoundQuery {
        BoundQuery {
            sql: sql.into(),
            bind_variables,
        }
    }

    /// Produces the SQL text with every `:name` placeholder outside of quoted
    /// strings and identifiers replaced by the literal encoding of its value.
    ///
    /// `::` (a cast) is left alone. A placeholder without a bound value is an
    /// error.
    pub fn render(&self) -> Result<String, SqlError> {
        let mut out = String::with_capacity(self.sql.len());
        let mut quote: Option<char> = None;
        let mut chars = self.sql.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if let Some(q) = quote {
                out.push(c);
                if c == '\\' {
                    if let Some((_, escaped)) = chars.next() {
                        out.push(escaped);
                    }
                } else if c == q {
                    quote = None;
                }
                continue;
            }
            match c {
                '\'' | '"' | '`' => {
                    quote = Some(c);
                    out.push(c);
                }
                ':' => match chars.peek() {
                    Some((_, ':')) => {
                        out.push_str("::");
                        chars.next();
                    }
                    Some((_, next)) if next.is_ascii_alphabetic() || *next == '_' => {
                        let start = i + 1;
                        let mut end = start;
                        while let Some((j, n)) = chars.peek() {
                            if n.is_ascii_alphanumeric() || *n == '_' {
                                end = j + n.len_utf8();
                                chars.next();
                            } else {
                                break;
                            }
                        }
                        let name = &self.sql[start..end];
                        match self.bind_variables.get(name) {
                            Some(value) => value.encode_sql(&mut out)?,
                            None => {
                                return Err(SqlError::new(
                                    ErrorCode::InvalidArgument,
                                    format!("missing bind var {name}"),
                                ));
                            }
                        }
                    }
                    _ => out.push(c),
                },
                c => out.push(c),
            }
        }
        Ok(out)
    }
}
