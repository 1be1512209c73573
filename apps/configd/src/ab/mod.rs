pub mod service;
pub mod types;

#[cfg(test)]
mod tests;

pub use service::{AbTestError, AbTestHelper};
pub use types::{OverrideGroupRequest, OverrideGroupSummary};
