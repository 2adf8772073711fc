//! Agent 注册表：发现并缓存 Worker 的能力清单
//!
//! 发现是尽力而为的短超时请求，失败只会让该 endpoint 缺席；刷新时整体替换清单。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::manifest::AgentManifest;
use super::RegistryError;

/// 取 Agent Card 的方式
#[async_trait]
pub trait ManifestFetcher: Send + Sync {
    async fn fetch(&self, endpoint: &str) -> Result<AgentManifest, RegistryError>;
}

/// 通过 HTTP 读取 `{endpoint}/.well-known/agent.json`
pub struct HttpManifestFetcher {
    http: reqwest::Client,
}

impl HttpManifestFetcher {
    pub fn new(timeout: Duration) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RegistryError::Fetch {
                endpoint: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { http })
    }

    pub fn card_url(endpoint: &str) -> String {
        format!("{}/.well-known/agent.json", endpoint.trim_end_matches('/'))
    }
}

#[async_trait]
impl ManifestFetcher for HttpManifestFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<AgentManifest, RegistryError> {
        let fetch_err = |reason: String| RegistryError::Fetch {
            endpoint: endpoint.to_string(),
            reason,
        };
        let response = self
            .http
            .get(Self::card_url(endpoint))
            .send()
            .await
            .map_err(|e| fetch_err(e.to_string()))?;
        if !response.status().is_success() {
            return Err(fetch_err(format!("HTTP {}", response.status())));
        }
        let card: serde_json::Value = response.json().await.map_err(|e| fetch_err(e.to_string()))?;
        AgentManifest::from_card(endpoint, &card)
    }
}

/// 固定清单（测试与离线模式）
#[derive(Default)]
pub struct StaticManifestFetcher {
    manifests: BTreeMap<String, AgentManifest>,
}

impl StaticManifestFetcher {
    pub fn new(manifests: impl IntoIterator<Item = AgentManifest>) -> Self {
        Self {
            manifests: manifests.into_iter().map(|m| (m.endpoint.clone(), m)).collect(),
        }
    }
}

#[async_trait]
impl ManifestFetcher for StaticManifestFetcher {
    async fn fetch(&self, endpoint: &str) -> Result<AgentManifest, RegistryError> {
        self.manifests
            .get(endpoint)
            .cloned()
            .ok_or_else(|| RegistryError::Fetch {
                endpoint: endpoint.to_string(),
                reason: "unreachable".into(),
            })
    }
}

/// Agent 注册表：endpoint -> 清单；按 endpoint 有序，保证查找结果稳定
pub struct AgentRegistry {
    fetcher: Arc<dyn ManifestFetcher>,
    manifests: RwLock<BTreeMap<String, Arc<AgentManifest>>>,
}

impl AgentRegistry {
    pub fn new(fetcher: Arc<dyn ManifestFetcher>) -> Self {
        Self {
            fetcher,
            manifests: RwLock::new(BTreeMap::new()),
        }
    }

    /// 发现单个 Agent；失败只记日志，不影响已缓存的其它 Agent
    pub async fn discover(&self, endpoint: &str) -> Option<Arc<AgentManifest>> {
        match self.fetcher.fetch(endpoint).await {
            Ok(manifest) => {
                let manifest = Arc::new(manifest);
                tracing::info!(
                    endpoint,
                    name = %manifest.name,
                    skills = manifest.skills.len(),
                    "Discovered agent"
                );
                self.manifests
                    .write()
                    .await
                    .insert(endpoint.to_string(), Arc::clone(&manifest));
                Some(manifest)
            }
            Err(e) => {
                tracing::warn!(endpoint, "Agent discovery failed: {}", e);
                None
            }
        }
    }

    /// 并发发现一组 Agent，返回成功的数量
    pub async fn discover_all(&self, endpoints: &[String]) -> usize {
        let results = futures_util::future::join_all(endpoints.iter().map(|e| self.discover(e))).await;
        let found = results.iter().filter(|r| r.is_some()).count();
        tracing::info!("Discovered {}/{} agents", found, endpoints.len());
        found
    }

    /// 直接登记一个清单（替换同 endpoint 的旧清单）
    pub async fn register(&self, manifest: AgentManifest) {
        self.manifests
            .write()
            .await
            .insert(manifest.endpoint.clone(), Arc::new(manifest));
    }

    pub async fn get(&self, endpoint: &str) -> Option<Arc<AgentManifest>> {
        self.manifests.read().await.get(endpoint).cloned()
    }

    pub async fn all(&self) -> Vec<Arc<AgentManifest>> {
        self.manifests.read().await.values().cloned().collect()
    }

    /// 能力 / 技能中包含 text 的 Agent（大小写不敏感）
    pub async fn find_by_capability(&self, text: &str) -> Vec<Arc<AgentManifest>> {
        self.manifests
            .read()
            .await
            .values()
            .filter(|m| m.matches(text))
            .cloned()
            .collect()
    }

    /// 把 Agent 名称或 endpoint 解析为已登记的 endpoint
    pub async fn resolve(&self, name_or_endpoint: &str) -> Option<String> {
        let wanted = name_or_endpoint.trim();
        if wanted.is_empty() {
            return None;
        }
        let manifests = self.manifests.read().await;
        let trimmed = wanted.trim_end_matches('/');
        if let Some(m) = manifests
            .values()
            .find(|m| m.endpoint.trim_end_matches('/') == trimmed)
        {
            return Some(m.endpoint.clone());
        }
        manifests
            .values()
            .find(|m| m.name.eq_ignore_ascii_case(wanted))
            .map(|m| m.endpoint.clone())
    }

    /// 推理上下文中的 Agent 列表
    pub async fn summary(&self) -> String {
        let manifests = self.manifests.read().await;
        if manifests.is_empty() {
            return "No agents discovered yet.".to_string();
        }
        manifests
            .values()
            .map(|m| m.summary())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub async fn len(&self) -> usize {
        self.manifests.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.manifests.read().await.is_empty()
    }
}
