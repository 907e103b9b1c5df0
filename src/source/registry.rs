use super::{HttpSourceResolver, ResolvedSource, SourceResolver};
use crate::config::SourceRoute;
use crate::error::SourceError;
use crate::task::SourceDescriptor;
use async_trait::async_trait;
use reqwest::Url;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

struct Route {
    /// 小写域名，匹配自身及其子域名
    hosts: Vec<String>,
    resolver: Arc<dyn SourceResolver>,
}

/// 解析器注册表
///
/// 按域名把链接交给对应平台的解析器，未匹配的链接走直链解析
pub struct ResolverRegistry {
    routes: Vec<Route>,
    fallback: Arc<dyn SourceResolver>,
}

impl ResolverRegistry {
    pub fn new(fallback: Arc<dyn SourceResolver>) -> Self {
        Self {
            routes: Vec::new(),
            fallback,
        }
    }

    /// 按配置的平台路由组装注册表
    pub fn from_config(
        fallback: Arc<dyn SourceResolver>,
        routes: &[SourceRoute],
        connect_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let mut registry = Self::new(fallback);
        for route in routes {
            let resolver = HttpSourceResolver::for_route(route, connect_timeout)?;
            info!("注册解析器 {}: {:?}", route.name, route.hosts);
            registry.register(&route.hosts, Arc::new(resolver));
        }
        Ok(registry)
    }

    /// 注册平台解析器，先注册的优先
    pub fn register<S: AsRef<str>>(&mut self, hosts: &[S], resolver: Arc<dyn SourceResolver>) {
        self.routes.push(Route {
            hosts: hosts
                .iter()
                .map(|h| h.as_ref().trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
            resolver,
        });
    }

    /// 选择链接对应的解析器
    pub fn route(&self, url: &str) -> &Arc<dyn SourceResolver> {
        let host = Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()));

        if let Some(host) = host {
            for route in &self.routes {
                if route.hosts.iter().any(|pattern| host_matches(&host, pattern)) {
                    return &route.resolver;
                }
            }
        }
        &self.fallback
    }
}

fn host_matches(host: &str, pattern: &str) -> bool {
    host == pattern
        || host
            .strip_suffix(pattern)
            .map_or(false, |prefix| prefix.ends_with('.'))
}

#[async_trait]
impl SourceResolver for ResolverRegistry {
    fn name(&self) -> &str {
        "registry"
    }

    async fn resolve(&self, source: &SourceDescriptor) -> Result<ResolvedSource, SourceError> {
        let resolver = self.route(&source.url);
        debug!("链接 {} 使用解析器 {}", source.url, resolver.name());
        resolver.resolve(source).await
    }

    async fn reopen(
        &self,
        source: &SourceDescriptor,
        offset: u64,
    ) -> Result<ResolvedSource, SourceError> {
        self.route(&source.url).reopen(source, offset).await
    }
}
