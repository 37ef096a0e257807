//! Device registry.
//!
//! Registration is keyed by the installation's stable device id and is
//! idempotent. Until the remote store acknowledges the device, the session
//! runs in an unregistered mode with sync disabled.

use std::sync::Arc;

use tracing::{info, warn};

use crate::context::SessionContext;
use crate::db::{DeviceRepository, SyncMetaRepository, REGISTERED_DEVICE_KEY};
use crate::error::{Error, Result};
use crate::models::{Device, DeviceInfo};
use crate::state::SyncState;
use crate::util::{now_millis, Backoff};

#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    ctx: Arc<SessionContext>,
}

impl DeviceRegistry {
    pub const fn new(ctx: Arc<SessionContext>) -> Self {
        Self { ctx }
    }

    /// Register this installation with the account.
    ///
    /// The device is recorded locally first, then sent to the remote store
    /// with retries. Re-registering refreshes versions and `last_seen_at`.
    pub async fn register_device(&self, info: DeviceInfo) -> Result<Device> {
        if info.device_id.trim().is_empty() {
            return Err(Error::InvalidInput("device id must not be empty".to_string()));
        }
        if info.device_id != self.ctx.device_id {
            return Err(Error::InvalidInput(format!(
                "session belongs to device '{}', not '{}'",
                self.ctx.device_id, info.device_id
            )));
        }

        let account_id = &self.ctx.account_id;
        let device = Device::from_info(account_id.clone(), info, now_millis());
        self.ctx
            .store
            .write(|tx| DeviceRepository::new(tx).upsert(&device))?;

        let attempts = self.ctx.config.registry_attempts.max(1);
        let mut backoff = Backoff::new(self.ctx.config.retry_base(), self.ctx.config.max_backoff());
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.ctx.remote.register_device(&device).await {
                Ok(registered) => {
                    self.ctx.store.write(|tx| {
                        DeviceRepository::new(tx).replace(&registered)?;
                        SyncMetaRepository::new(tx).set(
                            account_id,
                            REGISTERED_DEVICE_KEY,
                            &registered.device_id,
                        )
                    })?;
                    info!(
                        device_id = %registered.device_id,
                        is_primary = registered.is_primary,
                        "Device registered"
                    );
                    self.ctx.update_status(|status| {
                        if status.state == SyncState::Disabled {
                            status.state = SyncState::Offline;
                        }
                    });
                    return Ok(registered);
                }
                Err(error) if error.is_retryable() && attempt < attempts => {
                    let delay = error.retry_after().unwrap_or_else(|| backoff.next_delay());
                    warn!(%error, attempt, ?delay, "Device registration failed; retrying");
                    last_error = error.to_string();
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    last_error = error.to_string();
                    break;
                }
            }
        }

        warn!(device_id = %device.device_id, error = %last_error, "Device unregistered; sync disabled");
        self.ctx.update_status(|status| status.state = SyncState::Disabled);
        Err(Error::RegistrationFailure(last_error))
    }

    /// Whether the remote store has acknowledged this device
    pub fn is_registered(&self) -> Result<bool> {
        let registered = self.ctx.store.read(|conn| {
            SyncMetaRepository::new(conn).get(&self.ctx.account_id, REGISTERED_DEVICE_KEY)
        })?;
        Ok(registered.as_deref() == Some(self.ctx.device_id.as_str()))
    }

    /// Devices known locally for an account, primary first
    pub fn list_devices(&self, account_id: &str) -> Result<Vec<Device>> {
        self.ctx
            .store
            .read(|conn| DeviceRepository::new(conn).list(account_id))
    }

    /// Replace the local device list with the remote store's view
    pub async fn refresh_devices(&self) -> Result<Vec<Device>> {
        let devices = self.ctx.remote.list_devices().await?;
        self.ctx.store.write(|tx| {
            let repo = DeviceRepository::new(tx);
            for device in &devices {
                repo.replace(device)?;
            }
            Ok(())
        })?;
        self.list_devices(&self.ctx.account_id)
    }

    /// Record that a device was seen now
    pub fn touch(&self, device_id: &str) -> Result<()> {
        let touched = self.ctx.store.write(|tx| {
            DeviceRepository::new(tx).touch(&self.ctx.account_id, device_id, now_millis())
        })?;
        if touched {
            Ok(())
        } else {
            Err(Error::NotFound(format!("device {device_id}")))
        }
    }

    /// Make one device the account's primary, clearing the flag on the rest.
    ///
    /// The local change is a single atomic update. The remote store is told
    /// afterwards; failing to reach it is logged and retried on the next call.
    pub async fn set_primary(&self, device_id: &str) -> Result<()> {
        let updated = self.ctx.store.write(|tx| {
            DeviceRepository::new(tx).set_primary(&self.ctx.account_id, device_id)
        })?;
        if !updated {
            return Err(Error::NotFound(format!("device {device_id}")));
        }
        info!(device_id, "Primary device changed");

        if let Err(error) = self.ctx.remote.set_primary_device(device_id).await {
            warn!(device_id, %error, "Failed to update primary device remotely");
        }
        Ok(())
    }

    /// Devices are never deleted, only marked inactive
    pub fn mark_inactive(&self, device_id: &str) -> Result<()> {
        let updated = self.ctx.store.write(|tx| {
            DeviceRepository::new(tx).set_active(&self.ctx.account_id, device_id, false)
        })?;
        if updated {
            info!(device_id, "Device marked inactive");
            Ok(())
        } else {
            Err(Error::NotFound(format!("device {device_id}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{harness, ACCOUNT};
    use crate::models::Platform;
    use crate::remote::MemoryBackend;
    use pretty_assertions::assert_eq;

    fn info(device_id: &str, app_version: &str) -> DeviceInfo {
        DeviceInfo {
            device_id: device_id.to_string(),
            platform: Platform::Ios,
            app_version: app_version.to_string(),
            os_version: "17.4".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registration_is_idempotent() {
        let h = harness("dev-a", Arc::new(MemoryBackend::new()));
        let registry = DeviceRegistry::new(h.ctx.clone());

        let first = registry.register_device(info("dev-a", "1.0")).await.unwrap();
        assert!(first.is_primary);
        let again = registry.register_device(info("dev-a", "1.1")).await.unwrap();
        assert_eq!(again.app_version, "1.1");
        assert_eq!(again.registered_at, first.registered_at);

        let devices = registry.list_devices(ACCOUNT).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(registry.is_registered().unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unreachable_remote_leaves_sync_disabled() {
        let h = harness("dev-a", Arc::new(MemoryBackend::new()));
        h.remote.set_reachable(false);
        let registry = DeviceRegistry::new(h.ctx.clone());

        let result = registry.register_device(info("dev-a", "1.0")).await;
        assert!(matches!(result, Err(Error::RegistrationFailure(_))));
        assert!(!registry.is_registered().unwrap());
        assert_eq!(h.ctx.status().state, SyncState::Disabled);

        // Recorded locally so it can be retried.
        assert_eq!(registry.list_devices(ACCOUNT).unwrap().len(), 1);

        h.remote.set_reachable(true);
        registry.register_device(info("dev-a", "1.0")).await.unwrap();
        assert_ne!(h.ctx.status().state, SyncState::Disabled);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn primary_flag_is_exclusive() {
        let backend = Arc::new(MemoryBackend::new());
        let a = harness("dev-a", backend.clone());
        let b = harness("dev-b", backend.clone());
        DeviceRegistry::new(a.ctx.clone())
            .register_device(info("dev-a", "1.0"))
            .await
            .unwrap();
        DeviceRegistry::new(b.ctx.clone())
            .register_device(info("dev-b", "1.0"))
            .await
            .unwrap();

        let registry = DeviceRegistry::new(a.ctx.clone());
        let devices = registry.refresh_devices().await.unwrap();
        assert_eq!(devices.len(), 2);

        registry.set_primary("dev-b").await.unwrap();
        let primaries: Vec<_> = registry
            .list_devices(ACCOUNT)
            .unwrap()
            .into_iter()
            .filter(|d| d.is_primary)
            .map(|d| d.device_id)
            .collect();
        assert_eq!(primaries, vec!["dev-b".to_string()]);
        assert!(backend
            .list_devices(ACCOUNT)
            .iter()
            .any(|d| d.device_id == "dev-b" && d.is_primary));

        assert!(matches!(
            registry.set_primary("dev-z").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn inactive_devices_are_kept() {
        let h = harness("dev-a", Arc::new(MemoryBackend::new()));
        let registry = DeviceRegistry::new(h.ctx.clone());
        registry.register_device(info("dev-a", "1.0")).await.unwrap();

        registry.mark_inactive("dev-a").unwrap();
        let devices = registry.list_devices(ACCOUNT).unwrap();
        assert_eq!(devices.len(), 1);
        assert!(!devices[0].is_active);
        registry.touch("dev-a").unwrap();
        assert!(registry.touch("dev-z").is_err());
    }
}
