//! 群元数据 HTTP 接口：GroupFetcher 的 reqwest 实现

use async_trait::async_trait;
use imbot_share::{FetchError, GroupFetcher, GroupId, RawGroup, SessionId};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

pub struct HttpGroupFetcher {
    client: reqwest::Client,
    base_url: String,
    session: SessionId,
}

impl HttpGroupFetcher {
    pub fn new(base_url: &str, session: SessionId, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    fn groups_url(&self) -> String {
        format!(
            "{}/api/sessions/{}/groups",
            self.base_url,
            urlencoding::encode(self.session.as_str())
        )
    }

    fn group_url(&self, id: &GroupId) -> String {
        format!("{}/{}", self.groups_url(), urlencoding::encode(id.as_str()))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        debug!(url, "请求群元数据");
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Backend(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GroupFetcher for HttpGroupFetcher {
    async fn fetch_one(&self, id: &GroupId) -> Result<RawGroup, FetchError> {
        match self.get_json(&self.group_url(id)).await {
            Err(FetchError::Status { status: 404, .. }) => Err(FetchError::NotFound(id.clone())),
            other => other,
        }
    }

    async fn fetch_all(&self) -> Result<HashMap<GroupId, RawGroup>, FetchError> {
        self.get_json(&self.groups_url()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_encoded_urls() {
        let fetcher = HttpGroupFetcher::new(
            "http://api.local:3000/",
            SessionId::from("bot 1"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(fetcher.groups_url(), "http://api.local:3000/api/sessions/bot%201/groups");
        assert_eq!(
            fetcher.group_url(&GroupId::from("123@g.us")),
            "http://api.local:3000/api/sessions/bot%201/groups/123%40g.us"
        );
    }
}
