// Progress sink for query execution. Every method defaults to a no-op.
use crate::core::batch::{BatchSummary, ResultMessage};
use crate::core::result_set::ResultSetSummary;

pub trait QueryEvents: Send + Sync {
    fn query_started(&self, _owner_uri: &str) {}

    fn batch_started(&self, _batch: &BatchSummary) {}

    fn result_set_completed(&self, _result_set: &ResultSetSummary) {}

    fn message(&self, _message: &ResultMessage) {}

    fn batch_completed(&self, _batch: &BatchSummary) {}

    fn query_completed(&self, _owner_uri: &str, _batches: &[BatchSummary]) {}
}

/// Discards every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoEvents;

impl QueryEvents for NoEvents {}
