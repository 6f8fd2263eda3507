//! Aggregation behavior of join nodes.

use tracing::{debug, info};

use super::processor::Processor;
use super::ProcessorError;
use crate::token::Token;
use crate::types::ParallelMode;

impl Processor {
    /// Handle one branch arrival at the join.
    ///
    /// All decisions happen under the join-batch lock, and emission is
    /// additionally guarded by the durable `complete_join_batch` flag, so a
    /// batch reduces at most once (`All`/`Any`) no matter how often
    /// arrivals are redelivered.
    pub(crate) async fn aggregate(
        &self,
        token: Token,
        parallel: &str,
        mode: ParallelMode,
        reducer_name: &str,
    ) -> Result<Vec<Token>, ProcessorError> {
        let Some((parallel_id, batch_id)) = token
            .batch_key()
            .map(|(p, b)| (p.to_string(), b.to_string()))
        else {
            // A joined token can loop back here on cyclic graphs; it is
            // never folded again.
            self.fail_token(
                &token,
                "join",
                "aggregate",
                "arrival carries no batch correlation",
                false,
            )
            .await?;
            return Ok(Vec::new());
        };

        let Some(reducer) = self.ctx().reducers.get(reducer_name) else {
            self.fail_token(
                &token,
                "reducer",
                "aggregate",
                &format!("no reducer registered under '{reducer_name}'"),
                false,
            )
            .await?;
            return Ok(Vec::new());
        };

        let key = crate::coordination::LockKey::join_batch(
            &self.ctx().stream_id,
            &parallel_id,
            &batch_id,
        );
        let _guard = self.ctx().locks.lock(&key).await?;

        match mode {
            ParallelMode::Each => {
                let reduced = reducer.reduce(std::slice::from_ref(&token));
                let successors = self.emit(&token, reduced).await?;
                Ok(successors)
            }
            ParallelMode::Any => {
                if self
                    .ctx()
                    .store
                    .complete_join_batch(&parallel_id, &batch_id)
                    .await?
                {
                    let reduced = reducer.reduce(std::slice::from_ref(&token));
                    let successors = self.emit(&token, reduced).await?;
                    info!(parallel = %parallel, batch_id = %batch_id, "ANY join emitted on first arrival");
                    Ok(successors)
                } else {
                    debug!(batch_id = %batch_id, "ANY join already emitted; arrival discarded");
                    self.ctx().store.archive(&token.context_id).await?;
                    self.finalize_trace_if_done().await?;
                    Ok(Vec::new())
                }
            }
            ParallelMode::All => {
                let arrivals = self.ctx().store.buffer_join_arrival(&token).await?;
                let Some(group) = self
                    .ctx()
                    .store
                    .fork_group(&parallel_id, &batch_id)
                    .await?
                else {
                    self.fail_token(
                        &token,
                        "join",
                        "aggregate",
                        "no fork group recorded for this batch",
                        false,
                    )
                    .await?;
                    return Ok(Vec::new());
                };

                if arrivals >= group.branch_count
                    && self
                        .ctx()
                        .store
                        .complete_join_batch(&parallel_id, &batch_id)
                        .await?
                {
                    let buffered = self
                        .ctx()
                        .store
                        .join_arrivals(&parallel_id, &batch_id)
                        .await?;
                    let reduced = reducer.reduce(&buffered);
                    let successors = self.emit(&token, reduced).await?;
                    info!(
                        parallel = %parallel,
                        batch_id = %batch_id,
                        arrivals,
                        "ALL join complete; emitted reduced token"
                    );
                    Ok(successors)
                } else {
                    debug!(
                        batch_id = %batch_id,
                        arrivals,
                        expected = group.branch_count,
                        "branch arrival buffered"
                    );
                    self.ctx().store.archive(&token.context_id).await?;
                    // A sibling branch may have errored and will never
                    // arrive; close the trace if nothing is live anymore.
                    self.finalize_trace_if_done().await?;
                    Ok(Vec::new())
                }
            }
        }
    }

    /// Persist the reduced successors at the join's out edges and archive
    /// the consumed arrival, atomically.
    async fn emit(
        &self,
        arrival: &Token,
        reduced: serde_json::Value,
    ) -> Result<Vec<Token>, ProcessorError> {
        let successors: Vec<Token> = self
            .ctx()
            .definition
            .out_edges(self.node().id())
            .map(|edge| arrival.joined_successor(edge.to.clone(), reduced.clone()))
            .collect();
        Ok(self
            .ctx()
            .store
            .save_all_and_archive(&successors, &arrival.context_id)
            .await?)
    }
}
