use std::sync::atomic::{AtomicU64, Ordering};

/// Allocates identifiers for subscriptions, receipts and transactions as
/// decimal strings.
///
/// Each connection owns its own generator, so identifiers reveal nothing
/// about other connections in the process and restart from 1 on every new
/// session.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new() -> IdGenerator {
        IdGenerator::default()
    }

    /// The next identifier. The first call returns `"1"`.
    pub fn next_id(&self) -> String {
        let id = self.last.fetch_add(1, Ordering::Relaxed) + 1;
        id.to_string()
    }
}
