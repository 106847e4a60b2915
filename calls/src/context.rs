//! Explicit dependencies of one call

use crate::{config::CallConfig, error::CallResult, peer_connection::PeerBackendFactory};
use callrtc_signaling::SignalingStore;
use std::fmt;
use std::sync::Arc;

/// Everything an orchestrator needs from its environment
///
/// Built once by the application and cloned into each
/// [`CallOrchestrator`](crate::CallOrchestrator).
#[derive(Clone)]
pub struct CallContext {
    /// Id of the user on this device
    pub local_user_id: String,

    /// ICE servers, timeouts, retry policy
    pub config: CallConfig,

    /// Shared signaling store
    pub store: Arc<dyn SignalingStore>,

    /// Creates the native peer connection for each call
    pub peers: Arc<dyn PeerBackendFactory>,
}

impl CallContext {
    /// Bundle the call dependencies
    pub fn new(
        local_user_id: impl Into<String>,
        config: CallConfig,
        store: Arc<dyn SignalingStore>,
        peers: Arc<dyn PeerBackendFactory>,
    ) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            config,
            store,
            peers,
        }
    }

    /// Check the user id and configuration
    pub fn validate(&self) -> CallResult<()> {
        if self.local_user_id.trim().is_empty() {
            return Err(crate::CallError::validation(
                "local_user_id",
                "must not be empty",
            ));
        }
        self.config.validate()
    }
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("local_user_id", &self.local_user_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
