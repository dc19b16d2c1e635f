// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use serde::{Deserialize, Serialize};

use crate::value::{Value, ValueType};

pub type Row = Vec<Value>;

/// Describes one column of a [`QueryResult`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub typ: ValueType,
}

impl Field {
    pub fn new(name: impl Into<String>, typ: ValueType) -> Field {
        Field {
            name: name.into(),
            typ,
        }
    }
}

/// The result of a statement, or a chunk of a streamed result.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub fields: Vec<Field>,
    pub rows_affected: u64,
    pub insert_id: u64,
    pub rows: Vec<Row>,
    pub info: String,
}

impl QueryResult {
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.rows.is_empty() && self.rows_affected == 0
    }

    /// Folds the result of one shard into an aggregate.
    ///
    /// The first non-empty field list and the first non-zero insert id win,
    /// affected rows are summed and rows are concatenated in the order results
    /// are appended.
    pub fn append_result(&mut self, src: QueryResult) {
        if src.is_empty() {
            return;
        }
        if self.fields.is_empty() {
            self.fields = src.fields;
        }
        self.rows_affected += src.rows_affected;
        if self.insert_id == 0 {
            self.insert_id = src.insert_id;
        }
        self.rows.extend(src.rows);
    }
}
