// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::fmt;

use shardgate_types::{ErrorCode, HasErrorCode, ShardTarget, SqlError};

/// An error from one unit of a scatter call.
///
/// Errors raised by or for a shard name the shard; errors about the call as
/// a whole do not.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScatterError {
    pub target: Option<ShardTarget>,
    pub error: SqlError,
}

impl ScatterError {
    pub fn for_shard(target: ShardTarget, error: SqlError) -> ScatterError {
        ScatterError {
            target: Some(target),
            error,
        }
    }

    pub fn untargeted(error: SqlError) -> ScatterError {
        ScatterError {
            target: None,
            error,
        }
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code
    }
}

impl fmt::Display for ScatterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.target {
            Some(target) => write!(f, "target: {target}: {}", self.error),
            None => self.error.fmt(f),
        }
    }
}

impl std::error::Error for ScatterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl HasErrorCode for ScatterError {
    fn error_code(&self) -> ErrorCode {
        self.error.code
    }
}
