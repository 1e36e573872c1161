use async_trait::async_trait;

use crate::{ClientError, Resource};

/// Remote operations against a live cluster.
///
/// Implementations are expected to be cheap to share behind an `Arc` and must
/// map an absent object to [`ClientError::NotFound`].
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch the live state of `resource`.
    async fn get(&self, resource: &Resource) -> Result<Resource, ClientError>;

    /// Create or update `resource`, returning the live object.
    async fn apply(&self, resource: &Resource) -> Result<Resource, ClientError>;

    /// Delete `resource`.
    async fn delete(&self, resource: &Resource) -> Result<(), ClientError>;
}
