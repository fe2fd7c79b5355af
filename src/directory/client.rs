use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::DirectoryError;

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub online: bool,
}

/// The remote device directory. Every call is a fallible remote request.
#[async_trait]
pub trait DirectoryApi: Send + Sync {
    async fn login(&self, username: &str, password_sha256: &str) -> Result<String, DirectoryError>;
    async fn list_users(&self, token: &str) -> Result<Vec<String>, DirectoryError>;
    async fn list_channels(&self, token: &str) -> Result<Vec<Channel>, DirectoryError>;
    /// HTTP-FLV play address for a channel, empty when the remote has none.
    async fn play(&self, token: &str, channel_id: &str) -> Result<String, DirectoryError>;
}

pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Deserialize)]
struct LoginEnvelope {
    #[serde(rename = "EasyDarwin")]
    easy_darwin: LoginBody,
}

#[derive(Deserialize)]
struct LoginBody {
    #[serde(rename = "Body")]
    body: LoginToken,
}

#[derive(Deserialize)]
struct LoginToken {
    #[serde(rename = "Token")]
    token: String,
}

#[derive(Deserialize)]
struct Items<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Deserialize)]
struct UserItem {
    username: String,
}

#[derive(Deserialize)]
struct ChannelItem {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Value,
}

#[derive(Deserialize)]
struct PlayResponse {
    #[serde(default)]
    address: Option<PlayAddress>,
}

#[derive(Deserialize)]
struct PlayAddress {
    #[serde(default)]
    http_flv: Option<String>,
}

/// `reqwest` implementation against the remote directory's HTTP API.
#[derive(Clone)]
pub struct HttpDirectory {
    client: Client,
    base_url: String,
}

impl HttpDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DirectoryError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// `<base>/channels/<id>/play` with the id percent-encoded as one segment.
    fn play_url(&self, channel_id: &str) -> Result<Url, DirectoryError> {
        let mut url =
            Url::parse(&self.base_url).map_err(|e| DirectoryError::InvalidUrl(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|_| DirectoryError::InvalidUrl(self.base_url.clone()))?
            .pop_if_empty()
            .extend(["channels", channel_id, "play"]);
        Ok(url)
    }
}

#[async_trait]
impl DirectoryApi for HttpDirectory {
    async fn login(&self, username: &str, password_sha256: &str) -> Result<String, DirectoryError> {
        let envelope: LoginEnvelope = self
            .client
            .get(self.url("/api/v1/login"))
            .query(&[("username", username), ("password", password_sha256)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let token = envelope.easy_darwin.body.token;
        if token.is_empty() {
            return Err(DirectoryError::Payload("empty login token".into()));
        }
        debug!("Remote login succeeded for {}", username);
        Ok(token)
    }

    async fn list_users(&self, token: &str) -> Result<Vec<String>, DirectoryError> {
        let users: Items<UserItem> = self
            .client
            .get(self.url("/users"))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(users.items.into_iter().map(|u| u.username).collect())
    }

    async fn list_channels(&self, token: &str) -> Result<Vec<Channel>, DirectoryError> {
        let channels: Items<ChannelItem> = self
            .client
            .get(self.url("/channels"))
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(channels
            .items
            .into_iter()
            .filter_map(|item| {
                let id = value_to_id(&item.id)?;
                Some(Channel {
                    id,
                    name: item.name.unwrap_or_default(),
                    online: truthy(&item.status),
                })
            })
            .collect())
    }

    async fn play(&self, token: &str, channel_id: &str) -> Result<String, DirectoryError> {
        let play: PlayResponse = self
            .client
            .post(self.play_url(channel_id)?)
            .bearer_auth(token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(play
            .address
            .and_then(|address| address.http_flv)
            .unwrap_or_default())
    }
}

fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Null => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex("123456"),
            "8d969eef6ecad3c29a3a629280e686cf0c3f5d5a86aff3ca12020c923adc6c92"
        );
    }

    #[test]
    fn test_channel_fields() {
        assert_eq!(value_to_id(&json!("cam-1")), Some("cam-1".to_string()));
        assert_eq!(value_to_id(&json!(7)), Some("7".to_string()));
        assert_eq!(value_to_id(&json!(null)), None);
        assert!(truthy(&json!(true)));
        assert!(truthy(&json!(1)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(null)));
    }

    #[test]
    fn test_login_envelope_parses() {
        let envelope: LoginEnvelope =
            serde_json::from_value(json!({"EasyDarwin": {"Body": {"Token": "t0k"}}})).unwrap();
        assert_eq!(envelope.easy_darwin.body.token, "t0k");

        let items: Items<UserItem> = serde_json::from_value(json!({})).unwrap();
        assert!(items.items.is_empty());
    }

    #[test]
    fn test_trims_base_url() {
        let directory =
            HttpDirectory::new("http://example.invalid:10000/", Duration::from_secs(5)).unwrap();
        assert_eq!(directory.url("/users"), "http://example.invalid:10000/users");
    }

    #[test]
    fn test_play_url_encodes_channel_id() {
        let directory =
            HttpDirectory::new("http://example.invalid:10000/", Duration::from_secs(5)).unwrap();
        assert_eq!(
            directory.play_url("cam-1").unwrap().as_str(),
            "http://example.invalid:10000/channels/cam-1/play"
        );
        assert_eq!(
            directory.play_url("a/b c?x").unwrap().as_str(),
            "http://example.invalid:10000/channels/a%2Fb%20c%3Fx/play"
        );

        let prefixed =
            HttpDirectory::new("http://example.invalid/api", Duration::from_secs(5)).unwrap();
        assert_eq!(
            prefixed.play_url("7").unwrap().as_str(),
            "http://example.invalid/api/channels/7/play"
        );
    }
}
