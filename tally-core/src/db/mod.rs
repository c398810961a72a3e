pub mod memory;
pub mod quota;
pub mod valkey;

pub use memory::InMemoryQuotaStore;
#[cfg(test)]
pub use quota::MockQuotaStore;
pub use quota::{AcquireRequest, CounterSpec, HintRequest, QuotaStore, StoreDecision};
pub use valkey::ValkeyConnectionInfo;
