//! 引擎级设置与 HTTP 客户端构建。
//! 运行期（per-run）的参数在 [crate::crawler::CrawlOptions]，这里只放进程级默认值。

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub user_agent: String,
    /// 单次请求总超时
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// 下载失败重试次数（不含首次请求）
    pub retry_count: u32,
    /// 搜索页导航失败重试次数
    pub nav_retry_count: u32,
    /// consent 弹窗单个选择器的点击等待
    pub consent_timeout: Duration,
    /// 下载并发度默认值（CrawlOptions 未指定时使用）
    pub max_concurrent_downloads: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            user_agent: "Snapcrawl/0.3".to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            retry_count: 2,
            nav_retry_count: 2,
            consent_timeout: Duration::from_millis(1500),
            max_concurrent_downloads: 5,
        }
    }
}

/// 构建 reqwest 客户端：遵循 HTTP_PROXY / HTTPS_PROXY / NO_PROXY 环境变量。
/// 重定向关闭，由调用方手动跟随（下载与静态会话各自限制跳数）。
pub fn create_client(settings: &EngineSettings) -> Result<reqwest::Client, String> {
    let mut client_builder = reqwest::Client::builder();

    if let Ok(proxy_url) = std::env::var("HTTP_PROXY")
        .or_else(|_| std::env::var("http_proxy"))
        .or_else(|_| std::env::var("HTTPS_PROXY"))
        .or_else(|_| std::env::var("https_proxy"))
    {
        if !proxy_url.trim().is_empty() {
            match reqwest::Proxy::all(&proxy_url) {
                Ok(proxy) => {
                    client_builder = client_builder.proxy(proxy);
                }
                Err(e) => {
                    eprintln!("代理配置无效 ({}), 将使用直连: {}", proxy_url, e);
                }
            }
        }
    }

    if let Ok(no_proxy) = std::env::var("NO_PROXY").or_else(|_| std::env::var("no_proxy")) {
        for domain in no_proxy.split(',').map(|s| s.trim()) {
            if domain.is_empty() {
                continue;
            }
            match reqwest::Proxy::all(&format!("direct://{}", domain)) {
                Ok(proxy) => {
                    client_builder = client_builder.proxy(proxy);
                }
                Err(e) => {
                    eprintln!("跳过无效的 NO_PROXY 配置 {}: {}", domain, e);
                }
            }
        }
    }

    client_builder
        .timeout(settings.request_timeout)
        .connect_timeout(settings.connect_timeout)
        .redirect(reqwest::redirect::Policy::none())
        .user_agent(settings.user_agent.clone())
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {}", e))
}
