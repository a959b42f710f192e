//! Chain reads an observation session needs, over a shared dispatcher.

use std::sync::Arc;

use serde_json::Value;

use crate::dispatcher::{Method, RequestDispatcher};
use crate::error::DispatchError;
use crate::methods;
use crate::types::{BlockHeader, TransactionReceipt};

#[derive(Clone)]
pub(crate) struct ChainReader {
    dispatcher: Arc<RequestDispatcher>,
    receipt: Method<Option<TransactionReceipt>>,
    by_number: Method<Option<BlockHeader>>,
    by_hash: Method<Option<BlockHeader>>,
    head: Method<u64>,
}

impl ChainReader {
    pub(crate) fn new(dispatcher: Arc<RequestDispatcher>) -> Self {
        Self {
            dispatcher,
            receipt: methods::transaction_receipt(),
            by_number: methods::block_by_number(),
            by_hash: methods::block_by_hash(),
            head: methods::block_number(),
        }
    }

    /// Receipt for `tx_hash`; receipts that do not yet name a block count as
    /// absent.
    pub(crate) async fn receipt(&self, tx_hash: &str) -> Result<Option<TransactionReceipt>, DispatchError> {
        let receipt = self
            .dispatcher
            .execute(&self.receipt, vec![Value::from(tx_hash)])
            .await?;
        Ok(receipt.filter(TransactionReceipt::is_mined))
    }

    pub(crate) async fn block_by_hash(&self, hash: &str) -> Result<Option<BlockHeader>, DispatchError> {
        self.dispatcher
            .execute(&self.by_hash, vec![Value::from(hash)])
            .await
    }

    /// Header of the block `receipt` was mined in, if the node serves it.
    pub(crate) async fn containing_block(
        &self,
        receipt: &TransactionReceipt,
    ) -> Result<Option<BlockHeader>, DispatchError> {
        match receipt.block_hash.as_deref() {
            Some(hash) => self.block_by_hash(hash).await,
            None => Ok(None),
        }
    }

    pub(crate) async fn block_by_number(&self, number: u64) -> Result<Option<BlockHeader>, DispatchError> {
        self.dispatcher
            .execute(&self.by_number, vec![Value::from(number)])
            .await
    }

    pub(crate) async fn latest(&self) -> Result<Option<BlockHeader>, DispatchError> {
        self.dispatcher
            .execute(&self.by_number, vec![Value::from("latest")])
            .await
    }

    pub(crate) async fn head_number(&self) -> Result<u64, DispatchError> {
        self.dispatcher.execute(&self.head, vec![]).await
    }
}
