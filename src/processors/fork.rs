//! Fork behavior of parallel nodes.

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use super::processor::Processor;
use super::ProcessorError;
use crate::token::{ForkGroup, Token};
use crate::types::{NodeId, ParallelMode};

impl Processor {
    /// Fork the consumed token into one child per branch.
    ///
    /// The fork group (with the branch count the join will wait for) is
    /// persisted before the children, so an aggregator resumed after a
    /// crash always finds the expected count. Children share a fresh
    /// `(parallel_id, batch_id)` pair and get their own `trans_id`.
    pub(crate) async fn fork(
        &self,
        token: Token,
        branch_heads: &[NodeId],
        mode: ParallelMode,
    ) -> Result<Vec<Token>, ProcessorError> {
        let parallel_id = Uuid::new_v4().to_string();
        let batch_id = Uuid::new_v4().to_string();

        let group = ForkGroup {
            parallel_id: parallel_id.clone(),
            batch_id: batch_id.clone(),
            stream_id: self.ctx().stream_id.clone(),
            branch_count: branch_heads.len() as u32,
            emitted: false,
            created_at: Utc::now(),
        };
        self.ctx().store.create_fork_group(&group).await?;

        let children: Vec<Token> = branch_heads
            .iter()
            .map(|head| token.fork_child(head.clone(), &parallel_id, &batch_id, mode))
            .collect();
        let children = self
            .ctx()
            .store
            .save_all_and_archive(&children, &token.context_id)
            .await?;

        info!(
            parallel_id = %parallel_id,
            batch_id = %batch_id,
            branches = branch_heads.len(),
            mode = %mode,
            "forked token into branches"
        );
        Ok(children)
    }
}
