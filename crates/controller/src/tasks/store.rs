//! Resource store for `DumpRequest` objects
//!
//! The status reporter reads and writes through [`ResourceStore`] so that
//! conflict handling can be exercised without an API server.

use crate::crds::DumpRequest;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use kube::api::{Api, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Fetch the latest copy, `None` if it has been deleted
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DumpRequest>>;

    /// Replace the status subresource.
    ///
    /// The write carries the object's `resourceVersion`; a stale version must
    /// surface as an error for which `Error::is_conflict` is true.
    async fn replace_status(&self, dump: &DumpRequest) -> Result<DumpRequest>;
}

/// `ResourceStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeDumpStore {
    client: Client,
}

impl KubeDumpStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ResourceStore for KubeDumpStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<DumpRequest>> {
        let api: Api<DumpRequest> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn replace_status(&self, dump: &DumpRequest) -> Result<DumpRequest> {
        let namespace = dump.namespace().ok_or(Error::MissingObjectKey)?;
        let name = dump.name_any();
        let api: Api<DumpRequest> = Api::namespaced(self.client.clone(), &namespace);

        debug!(
            dump_request = %name,
            resource_version = ?dump.resource_version(),
            "Replacing DumpRequest status"
        );

        let data = serde_json::to_vec(dump)?;
        Ok(api
            .replace_status(&name, &PostParams::default(), data)
            .await?)
    }
}
