pub mod store;
pub mod types;

pub use store::{AuditStore, AuditStoreError};
pub use types::{ConfigChangeEvent, ConfigEventKind};
