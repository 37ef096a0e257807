//! Remote store used when a profile has no remote configured.

use async_trait::async_trait;
use tandem_core::models::Device;
use tandem_core::remote::{PullResponse, PushRequest, PushResult, RemoteError, RemoteStore};

const NOT_CONFIGURED: &str = "no remote store configured for this profile";

/// Remote store that is never reachable.
///
/// Local edits still apply and queue; they are pushed once a remote URL is
/// configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineRemote;

impl OfflineRemote {
    fn unreachable() -> RemoteError {
        RemoteError::Unreachable(NOT_CONFIGURED.to_string())
    }
}

#[async_trait]
impl RemoteStore for OfflineRemote {
    async fn push(&self, _request: PushRequest) -> Result<Vec<PushResult>, RemoteError> {
        Err(Self::unreachable())
    }

    async fn pull(&self, _since: Option<&str>) -> Result<PullResponse, RemoteError> {
        Err(Self::unreachable())
    }

    async fn heartbeat(&self) -> Result<(), RemoteError> {
        Err(Self::unreachable())
    }

    async fn register_device(&self, _device: &Device) -> Result<Device, RemoteError> {
        Err(Self::unreachable())
    }

    async fn list_devices(&self) -> Result<Vec<Device>, RemoteError> {
        Err(Self::unreachable())
    }

    async fn set_primary_device(&self, _device_id: &str) -> Result<(), RemoteError> {
        Err(Self::unreachable())
    }
}
