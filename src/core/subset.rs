// Transport-ready row window of one result set.
use serde::Serialize;

use crate::core::error::Error;
use crate::core::query::Query;
use crate::core::result_set::ResultSet;
use crate::core::value::CellValue;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ResultSetSubset {
    pub row_count: usize,
    pub rows: Vec<Vec<CellValue>>,
}

impl ResultSetSubset {
    /// Missing batches or result sets are `NotFound`; bad row indices are `Range`.
    pub fn from_query(
        query: &Query,
        batch_index: usize,
        result_set_index: usize,
        start: i64,
        end: i64,
    ) -> Result<Self, Error> {
        let result_set = query.result_set(batch_index, result_set_index)?;
        Self::from_result_set(&result_set, start, end)
    }

    pub fn from_result_set(result_set: &ResultSet, start: i64, end: i64) -> Result<Self, Error> {
        let rows = result_set.get_subset(start, end)?;
        Ok(Self {
            row_count: rows.len(),
            rows,
        })
    }
}
