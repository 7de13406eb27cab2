//! Block-range driver: fetch a range through the batch caller, map it into
//! records, hand them to the export pipeline, then flush.

use crate::mapping;
use anyhow::Result;
use blockpipe_client::BatchCaller;
use blockpipe_core::CallRequest;
use blockpipe_export::PipelineHandle;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Totals over one `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RangeSummary {
    /// Blocks mapped and submitted
    pub blocks: u64,
    /// Block numbers the node returned `null` for
    pub missing: Vec<u64>,
    /// Block numbers whose call or mapping failed
    pub failed: Vec<u64>,
    /// Records submitted (blocks plus transactions)
    pub records: u64,
    /// Rows the pipeline committed during the range flushes
    pub committed_rows: u64,
}

impl RangeSummary {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.failed.is_empty()
    }
}

pub struct RangeDriver {
    caller: Arc<BatchCaller>,
    pipeline: PipelineHandle,
    blocks_per_range: u64,
    include_transactions: bool,
}

impl RangeDriver {
    pub fn new(
        caller: Arc<BatchCaller>,
        pipeline: PipelineHandle,
        blocks_per_range: u64,
        include_transactions: bool,
    ) -> Self {
        Self {
            caller,
            pipeline,
            blocks_per_range: blocks_per_range.max(1),
            include_transactions,
        }
    }

    fn block_request(&self, number: u64) -> CallRequest {
        CallRequest::new(
            "eth_getBlockByNumber",
            vec![json!(format!("0x{:x}", number)), json!(self.include_transactions)],
        )
    }

    /// Index blocks `from..=to`.
    ///
    /// Failed or missing blocks are reported in the summary rather than
    /// aborting the run; only a closed pipeline is an error.
    pub async fn run(&self, from: u64, to: u64) -> Result<RangeSummary> {
        let mut summary = RangeSummary::default();
        if from > to {
            return Ok(summary);
        }

        let mut start = from;
        loop {
            let end = start.saturating_add(self.blocks_per_range - 1).min(to);
            self.run_range(start, end, &mut summary).await?;
            if end == to {
                break;
            }
            start = end + 1;
        }

        info!(
            from,
            to,
            blocks = summary.blocks,
            records = summary.records,
            committed_rows = summary.committed_rows,
            missing = summary.missing.len(),
            failed = summary.failed.len(),
            "Block range indexed"
        );
        Ok(summary)
    }

    async fn run_range(&self, start: u64, end: u64, summary: &mut RangeSummary) -> Result<()> {
        let requests: Vec<CallRequest> = (start..=end).map(|n| self.block_request(n)).collect();
        let results = self.caller.call_batch(&requests).await;

        let mut records = Vec::new();
        for (number, request) in (start..=end).zip(&requests) {
            let outcome = match results.for_request(request) {
                Some(result) => result.outcome(),
                None => {
                    summary.failed.push(number);
                    continue;
                }
            };
            let payload = match outcome {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(block = number, error = %err, "Block fetch failed");
                    summary.failed.push(number);
                    continue;
                }
            };
            match mapping::block_records(payload) {
                Ok(Some(mapped)) => {
                    summary.blocks += 1;
                    records.extend(mapped);
                }
                Ok(None) => summary.missing.push(number),
                Err(err) => {
                    warn!(block = number, error = %err, "Block payload could not be mapped");
                    summary.failed.push(number);
                }
            }
        }

        summary.records += records.len() as u64;
        self.pipeline.submit_many(records).await?;
        let outcome = self.pipeline.flush().await?;
        summary.committed_rows += outcome.committed_rows;

        debug!(
            start,
            end,
            committed_rows = outcome.committed_rows,
            failed_partitions = outcome.failed_partitions,
            "Range flushed"
        );
        Ok(())
    }
}
