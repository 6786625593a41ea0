//! 搜索会话：套用查询变换、填充 URL 模板、带重试导航、best-effort 关闭 consent 弹窗。

use crate::browser::BrowserSession;
use crate::crawler::CancelFlag;
use crate::emitter::RunEmitter;
use crate::error::CrawlError;
use crate::provider::{ProviderDescriptor, QueryTransform};
use crate::settings::EngineSettings;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// 按声明顺序应用查询变换。
pub fn apply_transforms(query: &str, transforms: &[QueryTransform]) -> String {
    let mut q = query.to_string();
    for t in transforms {
        q = match t {
            QueryTransform::Lowercase => q.to_lowercase(),
            QueryTransform::Uppercase => q.to_uppercase(),
            QueryTransform::Trim => q.trim().to_string(),
            QueryTransform::SpacesToHyphens => q.split_whitespace().collect::<Vec<_>>().join("-"),
            QueryTransform::SpacesToPlus => q.split_whitespace().collect::<Vec<_>>().join("+"),
            QueryTransform::UrlEncode => urlencoding::encode(&q).into_owned(),
        };
    }
    q
}

/// 填充 `{query}` 与 searchParams 声明的命名占位符，解析为 Url。
/// 校验阶段已保证所有占位符都有取值。
pub fn build_search_url(
    descriptor: &ProviderDescriptor,
    query: &str,
) -> Result<Url, CrawlError> {
    let template = descriptor
        .search_url_template
        .as_deref()
        .ok_or_else(|| CrawlError::Config {
            provider: descriptor.name.clone(),
            message: "searchUrlTemplate 未配置".to_string(),
        })?;

    let q = apply_transforms(query, &descriptor.query_transforms);
    let mut out = template.replace("{query}", &q);
    for (k, v) in &descriptor.search_params {
        out = out.replace(&format!("{{{}}}", k), v);
    }

    Url::parse(&out).map_err(|e| CrawlError::Config {
        provider: descriptor.name.clone(),
        message: format!("搜索 URL 无法解析 '{}': {}", out, e),
    })
}

/// 打开搜索页：导航（小次数重试）后依序尝试 consent 选择器。
/// 返回实际导航到的 URL。
pub async fn open_search_page(
    session: &mut dyn BrowserSession,
    descriptor: &ProviderDescriptor,
    query: &str,
    settings: &EngineSettings,
    emitter: &RunEmitter,
    cancel: &CancelFlag,
) -> Result<Url, CrawlError> {
    let url = build_search_url(descriptor, query)?;
    let timeout = Duration::from_millis(descriptor.navigation.timeout_ms);
    let max_attempts = settings.nav_retry_count.saturating_add(1).max(1);

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        if cancel.is_canceled() {
            return Err(CrawlError::Canceled);
        }
        match session
            .navigate(&url, descriptor.navigation.wait_until, timeout)
            .await
        {
            Ok(()) => break,
            Err(e) => {
                if attempt < max_attempts {
                    emitter.emit_task_log(
                        "warn",
                        format!("导航失败（第 {} 次），将重试: {}", attempt, e),
                    );
                    let backoff_ms = (500u64)
                        .saturating_mul(2u64.saturating_pow(attempt - 1))
                        .min(5000);
                    sleep(Duration::from_millis(backoff_ms)).await;
                    continue;
                }
                return Err(CrawlError::Navigation {
                    provider: descriptor.name.clone(),
                    url: url.to_string(),
                    message: e.to_string(),
                });
            }
        }
    }

    // consent 弹窗：逐个短超时尝试，没有匹配不算错误
    for selector in &descriptor.consent_selectors {
        match session.click(selector, settings.consent_timeout).await {
            Ok(true) => {
                emitter.emit_task_log("info", format!("已关闭 consent 弹窗: {}", selector));
                break;
            }
            Ok(false) => {}
            Err(e) => {
                emitter.emit_task_log("warn", format!("consent 点击失败 {}: {}", selector, e));
            }
        }
    }

    Ok(url)
}
