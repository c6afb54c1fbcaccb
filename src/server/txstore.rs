// ABOUTME: Per-connection store of frames buffered under open transactions

use crate::errors::{Result, StompError};
use crate::frame::Frame;
use std::collections::HashMap;

/// Frames buffered for the transactions of a single connection.
///
/// Frames are stored in arrival order; `commit` hands them back in that order
/// for the connection to replay through its normal dispatch. Closing a
/// connection drops the store, discarding every open transaction.
#[derive(Debug, Default)]
pub(crate) struct TxStore {
    transactions: HashMap<String, Vec<Frame>>,
}

impl TxStore {
    pub fn new() -> TxStore {
        TxStore::default()
    }

    pub fn begin(&mut self, tx: &str) -> Result<()> {
        if self.transactions.contains_key(tx) {
            return Err(StompError::TxAlreadyInProgress);
        }
        self.transactions.insert(tx.to_string(), Vec::new());
        Ok(())
    }

    pub fn add(&mut self, tx: &str, frame: Frame) -> Result<()> {
        self.transactions
            .get_mut(tx)
            .ok_or(StompError::TxUnknown)?
            .push(frame);
        Ok(())
    }

    /// Close the transaction and return its frames in arrival order.
    pub fn commit(&mut self, tx: &str) -> Result<Vec<Frame>> {
        self.transactions.remove(tx).ok_or(StompError::TxUnknown)
    }

    /// Discard the transaction and everything buffered under it.
    pub fn abort(&mut self, tx: &str) -> Result<()> {
        self.transactions
            .remove(tx)
            .map(|_| ())
            .ok_or(StompError::TxUnknown)
    }
}
