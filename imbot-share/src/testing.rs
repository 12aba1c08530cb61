//! 测试用的假后端：群元数据拉取、连接器、凭证存储

use crate::error::FetchError;
use crate::group::GroupFetcher;
use crate::model::{GroupId, RawGroup};
use crate::session::{Connector, CredentialStore, SessionId};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Default)]
pub(crate) struct FakeFetcher {
    groups: Mutex<HashMap<GroupId, Value>>,
    failing: Mutex<HashSet<GroupId>>,
    all_fails: AtomicBool,
    delay: Option<Duration>,
    one_calls: AtomicUsize,
    all_calls: AtomicUsize,
}

impl FakeFetcher {
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn insert(&self, id: &str, group: Value) {
        self.groups.lock().unwrap().insert(GroupId::from(id), group);
    }

    pub(crate) fn fail(&self, id: &str) {
        self.failing.lock().unwrap().insert(GroupId::from(id));
    }

    pub(crate) fn recover(&self, id: &str) {
        self.failing.lock().unwrap().remove(id);
    }

    pub(crate) fn fail_all(&self, fail: bool) {
        self.all_fails.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn one_calls(&self) -> usize {
        self.one_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn all_calls(&self) -> usize {
        self.all_calls.load(Ordering::SeqCst)
    }

    fn decode(value: Value) -> Result<RawGroup, FetchError> {
        serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GroupFetcher for FakeFetcher {
    async fn fetch_one(&self, id: &GroupId) -> Result<RawGroup, FetchError> {
        self.one_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.lock().unwrap().contains(id) {
            return Err(FetchError::Backend(format!("{id} unavailable")));
        }
        let value = self.groups.lock().unwrap().get(id).cloned();
        match value {
            Some(v) => Self::decode(v),
            None => Err(FetchError::NotFound(id.clone())),
        }
    }

    async fn fetch_all(&self) -> Result<HashMap<GroupId, RawGroup>, FetchError> {
        self.all_calls.fetch_add(1, Ordering::SeqCst);
        if self.all_fails.load(Ordering::SeqCst) {
            return Err(FetchError::Backend("fetch all unavailable".to_string()));
        }
        let groups = self.groups.lock().unwrap().clone();
        groups
            .into_iter()
            .map(|(id, v)| Self::decode(v).map(|g| (id, g)))
            .collect()
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    opens: AtomicUsize,
    failing: AtomicBool,
}

impl FakeConnector {
    pub(crate) fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub(crate) fn fail(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn open(&self, _session: &SessionId) -> anyhow::Result<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("transport refused");
        }
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeCredentials {
    destroyed: Mutex<Vec<SessionId>>,
}

impl FakeCredentials {
    pub(crate) fn destroyed(&self) -> usize {
        self.destroyed.lock().unwrap().len()
    }
}

#[async_trait]
impl CredentialStore for FakeCredentials {
    async fn destroy(&self, session: &SessionId) -> anyhow::Result<()> {
        self.destroyed.lock().unwrap().push(session.clone());
        Ok(())
    }
}
