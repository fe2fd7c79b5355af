use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::directory::client::{sha256_hex, DirectoryApi};
use crate::error::DirectoryError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMeta {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Device {
    pub device_id: String,
    pub online: bool,
    pub last_seen: u64,
    pub stream_url: String,
    pub meta: DeviceMeta,
}

struct CacheEntry<T> {
    value: T,
    fetched_at: Instant,
}

impl<T> CacheEntry<T> {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoginCheck {
    Accepted,
    UnknownUser,
    WrongPassword,
}

/// Caching front of the remote directory. Remote failures degrade to empty
/// results instead of errors.
#[derive(Clone)]
pub struct DirectoryService {
    api: Arc<dyn DirectoryApi>,
    admin_username: String,
    shared_password: String,
    cache_ttl: Duration,
    users: Arc<Mutex<Option<CacheEntry<HashSet<String>>>>>,
}

impl DirectoryService {
    pub fn new(
        api: Arc<dyn DirectoryApi>,
        admin_username: impl Into<String>,
        shared_password: impl Into<String>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            api,
            admin_username: admin_username.into(),
            shared_password: shared_password.into(),
            cache_ttl,
            users: Arc::new(Mutex::new(None)),
        }
    }

    fn password_hash(&self) -> String {
        sha256_hex(&self.shared_password)
    }

    /// Remote usernames, refreshed at most once per cache window.
    pub async fn remote_users(&self) -> HashSet<String> {
        let mut cached = self.users.lock().await;
        if let Some(entry) = cached.as_ref().filter(|e| e.is_fresh(self.cache_ttl)) {
            return entry.value.clone();
        }
        match self.fetch_users().await {
            Ok(users) => {
                debug!("Fetched {} remote users", users.len());
                *cached = Some(CacheEntry {
                    value: users.clone(),
                    fetched_at: Instant::now(),
                });
                users
            }
            Err(e) => {
                warn!("Failed to fetch remote users: {}", e);
                HashSet::new()
            }
        }
    }

    async fn fetch_users(&self) -> Result<HashSet<String>, DirectoryError> {
        let token = self
            .api
            .login(&self.admin_username, &self.password_hash())
            .await?;
        Ok(self.api.list_users(&token).await?.into_iter().collect())
    }

    pub async fn verify_login(&self, username: &str, password: &str) -> LoginCheck {
        if !self.remote_users().await.contains(username) {
            return LoginCheck::UnknownUser;
        }
        if password != self.shared_password {
            return LoginCheck::WrongPassword;
        }
        LoginCheck::Accepted
    }

    /// Channels owned by `username`, online first then by id.
    pub async fn devices_for_user(&self, username: &str) -> Result<Vec<Device>, DirectoryError> {
        let token = self.api.login(username, &self.password_hash()).await?;
        let channels = self.api.list_channels(&token).await?;

        let mut devices = Vec::with_capacity(channels.len());
        for channel in channels {
            // Offline channels usually have no valid play address.
            let stream_url = if channel.online {
                self.api
                    .play(&token, &channel.id)
                    .await
                    .unwrap_or_else(|e| {
                        debug!("No play address for {}: {}", channel.id, e);
                        String::new()
                    })
            } else {
                String::new()
            };
            devices.push(Device {
                device_id: channel.id,
                online: channel.online,
                last_seen: 0,
                stream_url,
                meta: DeviceMeta { name: channel.name },
            });
        }
        devices.sort_by(|a, b| {
            (!a.online, &a.device_id).cmp(&(!b.online, &b.device_id))
        });
        Ok(devices)
    }
}
