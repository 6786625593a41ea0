//! 原图解析：候选引用 → 最终下载 URL。
//!
//! 五种策略分两类：direct / url_param_decode / url_cleaning 只在候选自身的 URL
//! 上做变换，不占用浏览器会话，可在滚动循环内联执行；detail_page / lightbox
//! 需要导航页面，由协调器在滚动结束后串行执行（会话是单写者资源）。

use crate::browser::BrowserSession;
use crate::crawler::CandidateItem;
use crate::error::CrawlError;
use crate::provider::{DetailWait, FullSizeStrategy, ProviderDescriptor};
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// 该策略是否需要浏览器会话。
pub fn needs_session(strategy: &FullSizeStrategy) -> bool {
    matches!(
        strategy,
        FullSizeStrategy::DetailPage { .. } | FullSizeStrategy::Lightbox { .. }
    )
}

fn resolution_err(provider: &str, url: &str, message: impl Into<String>) -> CrawlError {
    CrawlError::Resolution {
        provider: provider.to_string(),
        url: url.to_string(),
        message: message.into(),
    }
}

/// 从 URL 的原始 query 串中取出指定参数的未解码值。
/// query_pairs 会自动解码，这里需要保留原始形态以尊重 decode 开关。
fn raw_query_param<'a>(url: &'a Url, name: &str) -> Option<&'a str> {
    for pair in url.query()?.split('&') {
        let mut it = pair.splitn(2, '=');
        if it.next() == Some(name) {
            return Some(it.next().unwrap_or(""));
        }
    }
    None
}

/// URL 变换类策略（不需要会话）。候选的输入是其自身的引用 URL。
pub fn resolve_url_only(
    strategy: &FullSizeStrategy,
    provider: &str,
    candidate: &CandidateItem,
) -> Result<String, CrawlError> {
    let reference = candidate
        .primary_reference()
        .ok_or_else(|| resolution_err(provider, &candidate.id, "候选没有引用 URL"))?;

    match strategy {
        FullSizeStrategy::Direct => Ok(reference.to_string()),
        FullSizeStrategy::UrlParamDecode { param_name, decode } => {
            let url = Url::parse(reference)
                .map_err(|e| resolution_err(provider, reference, format!("URL 无法解析: {}", e)))?;
            let raw = raw_query_param(&url, param_name).ok_or_else(|| {
                resolution_err(
                    provider,
                    reference,
                    format!("参数 '{}' 不存在", param_name),
                )
            })?;
            if raw.is_empty() {
                return Err(resolution_err(
                    provider,
                    reference,
                    format!("参数 '{}' 为空", param_name),
                ));
            }
            if *decode {
                urlencoding::decode(raw)
                    .map(|v| v.into_owned())
                    .map_err(|e| {
                        resolution_err(provider, reference, format!("参数解码失败: {}", e))
                    })
            } else {
                Ok(raw.to_string())
            }
        }
        FullSizeStrategy::UrlCleaning { remove_params } => {
            let parsed = Url::parse(reference)
                .map_err(|e| resolution_err(provider, reference, format!("URL 无法解析: {}", e)))?;
            let mut cleaned = parsed.clone();
            let kept: Vec<(String, String)> = parsed
                .query_pairs()
                .filter(|(k, _)| !remove_params.iter().any(|r| r == k.as_ref()))
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect();
            if kept.is_empty() {
                cleaned.set_query(None);
            } else {
                let query = kept
                    .iter()
                    .map(|(k, v)| {
                        if v.is_empty() {
                            urlencoding::encode(k).into_owned()
                        } else {
                            format!("{}={}", urlencoding::encode(k), urlencoding::encode(v))
                        }
                    })
                    .collect::<Vec<_>>()
                    .join("&");
                cleaned.set_query(Some(&query));
            }
            Ok(cleaned.to_string())
        }
        FullSizeStrategy::DetailPage { .. } | FullSizeStrategy::Lightbox { .. } => Err(
            resolution_err(provider, reference, "该策略需要浏览器会话"),
        ),
    }
}

/// 相对地址按 baseUrl（优先）或当前页面地址解析。
fn resolve_against(
    value: &str,
    base_url: &Option<String>,
    page_url: &Url,
    provider: &str,
) -> Result<String, CrawlError> {
    let base = match base_url.as_deref().map(Url::parse) {
        Some(Ok(b)) => b,
        _ => page_url.clone(),
    };
    base.join(value.trim())
        .map(|u| u.to_string())
        .map_err(|e| resolution_err(provider, value, format!("URL 无法解析: {}", e)))
}

/// 导航类策略（detail_page / lightbox）。独占会话，逐候选串行执行。
pub async fn resolve_with_session(
    session: &mut dyn BrowserSession,
    descriptor: &ProviderDescriptor,
    candidate: &CandidateItem,
) -> Result<String, CrawlError> {
    let provider = descriptor.name.as_str();
    match &descriptor.full_size {
        FullSizeStrategy::DetailPage {
            wait,
            attribute,
            base_url,
        } => {
            let detail = candidate.detail_url.as_deref().ok_or_else(|| {
                resolution_err(provider, &candidate.id, "候选没有详情页 URL")
            })?;
            let detail_url = Url::parse(detail)
                .map_err(|e| resolution_err(provider, detail, format!("URL 无法解析: {}", e)))?;
            let nav_timeout = Duration::from_millis(descriptor.navigation.timeout_ms);
            session
                .navigate(&detail_url, descriptor.navigation.wait_until, nav_timeout)
                .await
                .map_err(|e| resolution_err(provider, detail, e.to_string()))?;

            // 等待成功的那个选择器就是取属性的目标元素
            let matched = match wait {
                DetailWait::Locator {
                    selector,
                    timeout_ms,
                } => {
                    let visible = session
                        .wait_visible(selector, Duration::from_millis(*timeout_ms))
                        .await
                        .map_err(|e| resolution_err(provider, detail, e.to_string()))?;
                    visible.then(|| selector.clone())
                }
                DetailWait::LocatorAny { selectors } => {
                    let mut found = None;
                    for entry in selectors {
                        let visible = session
                            .wait_visible(&entry.selector, Duration::from_millis(entry.timeout_ms))
                            .await
                            .map_err(|e| resolution_err(provider, detail, e.to_string()))?;
                        if visible {
                            found = Some(entry.selector.clone());
                            break;
                        }
                    }
                    found
                }
            };
            let selector = matched.ok_or_else(|| {
                resolution_err(provider, detail, "等待目标元素超时")
            })?;

            let value = session
                .read_attribute(&selector, attribute, Duration::from_millis(1000))
                .await
                .map_err(|e| resolution_err(provider, detail, e.to_string()))?
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    resolution_err(
                        provider,
                        detail,
                        format!("属性 '{}' 为空或不存在", attribute),
                    )
                })?;
            resolve_against(&value, base_url, &detail_url, provider)
        }
        FullSizeStrategy::Lightbox {
            click_selector,
            image_selectors,
            timeout_ms,
            fallback_delay_ms,
        } => {
            // 灯箱在候选的详情页（若有）或当前页面上打开
            let page_url = match candidate.detail_url.as_deref() {
                Some(detail) => {
                    let u = Url::parse(detail).map_err(|e| {
                        resolution_err(provider, detail, format!("URL 无法解析: {}", e))
                    })?;
                    let nav_timeout = Duration::from_millis(descriptor.navigation.timeout_ms);
                    session
                        .navigate(&u, descriptor.navigation.wait_until, nav_timeout)
                        .await
                        .map_err(|e| resolution_err(provider, detail, e.to_string()))?;
                    u
                }
                None => session
                    .current_url()
                    .await
                    .map_err(|e| resolution_err(provider, &candidate.id, e.to_string()))?,
            };

            // clickSelector 缺省 = 不点击（灯箱随导航直接打开）；
            // 元素不存在（Ok(false)）不算错误，会话级失败必须上报
            if let Some(sel) = click_selector {
                session
                    .click(sel, Duration::from_millis(*timeout_ms))
                    .await
                    .map_err(|e| resolution_err(provider, &candidate.id, e.to_string()))?;
            }

            for sel in image_selectors {
                let visible = session
                    .wait_visible(sel, Duration::from_millis(*timeout_ms))
                    .await
                    .map_err(|e| resolution_err(provider, &candidate.id, e.to_string()))?;
                if visible {
                    if let Some(src) = session
                        .read_attribute(sel, "src", Duration::from_millis(1000))
                        .await
                        .map_err(|e| resolution_err(provider, &candidate.id, e.to_string()))?
                        .filter(|v| !v.trim().is_empty())
                    {
                        return resolve_against(&src, &None, &page_url, provider);
                    }
                }
            }

            // 全部超时：固定延时后再读一轮 src
            sleep(Duration::from_millis(*fallback_delay_ms)).await;
            for sel in image_selectors {
                if let Some(src) = session
                    .read_attribute(sel, "src", Duration::from_millis(1000))
                    .await
                    .map_err(|e| resolution_err(provider, &candidate.id, e.to_string()))?
                    .filter(|v| !v.trim().is_empty())
                {
                    return resolve_against(&src, &None, &page_url, provider);
                }
            }
            Err(resolution_err(
                provider,
                &candidate.id,
                "灯箱图片元素未出现",
            ))
        }
        _ => resolve_url_only(&descriptor.full_size, provider, candidate),
    }
}
