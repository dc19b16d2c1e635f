// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cancellation and deadlines for work done on behalf of one request.

use std::time::Duration;

use shardgate_types::{ErrorCode, SqlError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a [`QueryContext`] is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

impl From<ContextError> for SqlError {
    fn from(err: ContextError) -> SqlError {
        let code = match err {
            ContextError::Canceled => ErrorCode::Canceled,
            ContextError::DeadlineExceeded => ErrorCode::DeadlineExceeded,
        };
        SqlError::new(code, err.to_string())
    }
}

/// Carries the cancellation signal and deadline of a request through every
/// layer that works on it.
///
/// Cloning is cheap and clones observe the same signal. Derived contexts
/// ([`QueryContext::child`], [`QueryContext::with_timeout`]) are canceled when
/// their parent is, but canceling them does not affect the parent.
#[derive(Clone, Debug)]
pub struct QueryContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for QueryContext {
    fn default() -> Self {
        QueryContext::background()
    }
}

impl QueryContext {
    /// A context that is never done unless explicitly canceled.
    pub fn background() -> QueryContext {
        QueryContext {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn child(&self) -> QueryContext {
        QueryContext {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn with_timeout(&self, timeout: Duration) -> QueryContext {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a child whose deadline is the earlier of `deadline` and this
    /// context's deadline.
    pub fn with_deadline(&self, deadline: Instant) -> QueryContext {
        let deadline = match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        };
        QueryContext {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason the context is done, or `None` if it is still live.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves once the context is canceled or its deadline passes.
    ///
    /// Cancel safe.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => ContextError::Canceled,
                _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                ContextError::Canceled
            }
        }
    }
}
