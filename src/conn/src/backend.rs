// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The wire-level seam: how physical database sessions are opened and driven.
//!
//! Everything above this module is protocol agnostic. A driver for a real
//! database implements [`Connector`] and [`RawConnection`]; tests use
//! [`crate::fakedb`].

use std::fmt::Debug;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shardgate_types::{QueryResult, SqlError};

/// Which parts of the field metadata a streamed result carries.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IncludedFields {
    TypeOnly,
    TypeAndName,
    #[default]
    All,
}

/// Receives the chunks of a streamed result. An error aborts the stream and
/// is returned from the streaming call unchanged.
pub type ChunkCallback<'a> = dyn FnMut(QueryResult) -> Result<(), SqlError> + Send + 'a;

/// Opens physical sessions to one database.
#[async_trait]
pub trait Connector: Debug + Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RawConnection>, SqlError>;
}

/// One physical database session.
///
/// Implementations need not be cancel safe beyond the guarantee that
/// dropping an in-flight future leaves the session either usable or
/// reporting [`RawConnection::is_closed`].
#[async_trait]
pub trait RawConnection: Debug + Send {
    /// The server-side session id. Kill statements name it.
    fn id(&self) -> u64;

    fn is_closed(&self) -> bool;

    /// Executes `sql` and buffers its result. Fails if the statement returns
    /// more than `max_rows` rows. Field metadata is dropped unless
    /// `want_fields` is set.
    async fn execute_fetch(
        &mut self,
        sql: &str,
        max_rows: usize,
        want_fields: bool,
    ) -> Result<QueryResult, SqlError>;

    /// Executes `sql`, handing the result to `callback` in chunks of at most
    /// `chunk_size` rows. Field metadata, if any, arrives first.
    async fn execute_streaming(
        &mut self,
        sql: &str,
        chunk_size: usize,
        included_fields: IncludedFields,
        callback: &mut ChunkCallback<'_>,
    ) -> Result<(), SqlError>;

    fn close(&mut self);
}
