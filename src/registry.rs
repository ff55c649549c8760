// =============================================================================
// Registry mirror — fire-and-forget replication of execution logs
// =============================================================================
//
// Enabled via MAX_REGISTRY (or the config's registry_endpoint). Every
// executed action is POSTed to the endpoint on a detached task; failures are
// logged and swallowed, never surfaced to the execution path.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::model::ExecutionLog;

pub struct RegistryMirror {
    endpoint: String,
    client: reqwest::Client,
}

impl RegistryMirror {
    pub fn new(endpoint: impl Into<String>) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .expect("failed to build reqwest client");
        Arc::new(Self {
            endpoint: endpoint.into(),
            client,
        })
    }

    /// Mirror a log entry without blocking the caller.
    pub fn mirror(&self, log: &ExecutionLog) {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        let log = log.clone();
        tokio::spawn(async move {
            match client.post(&endpoint).json(&log).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(log = %log.id, "execution log mirrored");
                }
                Ok(resp) => {
                    warn!(log = %log.id, status = %resp.status(), "registry mirror rejected log");
                }
                Err(e) => {
                    warn!(log = %log.id, error = %e, "registry mirror unreachable");
                }
            }
        });
    }
}

impl std::fmt::Debug for RegistryMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMirror")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
