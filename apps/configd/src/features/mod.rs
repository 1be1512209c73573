pub mod registry;
pub mod store;
pub mod types;

#[cfg(test)]
mod tests;

pub use registry::{FeatureRegistry, FeatureRegistryError};
pub use store::{FeatureStore, FeatureStoreError};
pub use types::{DependencyPolicy, FeatureFlagRow};
