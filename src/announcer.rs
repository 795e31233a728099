//! Pool Announcer
//!
//! Makes sure the VolumePool this operator instance serves exists, so a fresh
//! deployment shows up on the platform without manual steps.

use crate::crd::{VolumePool, VolumePoolSpec};
use crate::domain::ports::ObjectStore;
use crate::error::{Error, Result};
use tracing::{debug, info};

/// Provider id of a pool served by `provider`
pub fn provider_id(provider: &str, pool_name: &str) -> String {
    format!("{}://{}", provider, pool_name)
}

/// Create the VolumePool `name` unless it already exists
pub async fn announce_pool(
    store: &dyn ObjectStore<VolumePool>,
    provider: &str,
    name: &str,
    replication: u32,
) -> Result<VolumePool> {
    if let Some(existing) = store.get(name).await? {
        debug!(pool = %name, "VolumePool already announced");
        return Ok(existing);
    }

    let pool = VolumePool::new(
        name,
        VolumePoolSpec {
            provider_id: provider_id(provider, name),
            replication,
        },
    );
    match store.create(&pool).await {
        Ok(created) => {
            info!(pool = %name, provider_id = %created.spec.provider_id, replication, "Announced VolumePool");
            Ok(created)
        }
        Err(Error::ResourceExists { .. }) => store.get(name).await?.ok_or_else(|| Error::ResourceNotFound {
            kind: store.kind().to_string(),
            name: name.to_string(),
        }),
        Err(e) => Err(e),
    }
}
