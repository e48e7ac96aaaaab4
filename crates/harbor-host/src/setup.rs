//! Translate the host configuration into worker and loader settings.

use harbor_common::RetryConfig;
use harbor_core::{HostResult, ProxyConfig};
use harbor_net::LoaderConfig;
use harbor_sw::WorkerConfig;

/// Worker settings with every path resolved against the origin.
pub fn worker_config(config: &ProxyConfig) -> HostResult<WorkerConfig> {
    let origin = config.origin_url()?;
    let shell_urls = config
        .shell_urls
        .iter()
        .map(|url| origin.join(url))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(WorkerConfig {
        version: config.version.clone(),
        cache_prefix: config.cache_prefix.clone(),
        shell_urls,
        offline_url: origin.join(&config.offline_path)?,
        version_url: origin.join(&config.version_path)?,
        update_interval: config.update_interval(),
        fetch_timeout: config.fetch_timeout(),
        precache_retry: RetryConfig::attempts(config.install_attempts),
        app_name: config.app_name.clone(),
        origin,
    })
}

pub fn loader_config(config: &ProxyConfig) -> HostResult<LoaderConfig> {
    Ok(LoaderConfig {
        user_agent: config.user_agent.clone(),
        default_timeout: config.fetch_timeout(),
        origin: Some(config.origin_url()?),
        ..LoaderConfig::default()
    })
}
