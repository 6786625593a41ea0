//! 候选提取：对页面快照按声明的编码提取图片引用，并以规范化 URL 去重。
//! 去重在整个运行范围内累积，而不是每轮滚动单独去重。

use crate::crawler::CandidateItem;
use crate::emitter::RunEmitter;
use crate::provider::{ExtractionStrategy, ProviderDescriptor};
use scraper::{ElementRef, Html, Selector};
use std::collections::HashSet;
use url::Url;

/// 规范化 URL 作为去重键：scheme + host + path + 排序后的 query，去掉 fragment。
/// `base` 用于解析相对地址。
pub fn normalize_url(raw: &str, base: Option<&Url>) -> Result<String, String> {
    let parsed = match base {
        Some(b) => b.join(raw.trim()),
        None => Url::parse(raw.trim()),
    }
    .map_err(|e| format!("Invalid URL '{}': {}", raw, e))?;

    let mut normalized = parsed.clone();
    normalized.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        normalized.set_query(None);
    } else {
        pairs.sort();
        let query = pairs
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
        normalized.set_query(Some(&query));
    }
    Ok(normalized.to_string())
}

/// include/exclude 子串过滤：`!` 前缀为排除；存在 include 过滤器时至少命中一个。
fn passes_filters(value: &str, filters: &[String]) -> bool {
    let mut has_include = false;
    let mut include_hit = false;
    for f in filters {
        if let Some(excluded) = f.strip_prefix('!') {
            if !excluded.is_empty() && value.contains(excluded) {
                return false;
            }
        } else if !f.is_empty() {
            has_include = true;
            if value.contains(f.as_str()) {
                include_hit = true;
            }
        }
    }
    !has_include || include_hit
}

/// 点分路径读取 JSON 值（如 `murl` 或 `media.full.url`）。
fn json_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut cur = value;
    for seg in path.split('.') {
        cur = cur.get(seg)?;
    }
    Some(cur)
}

fn json_value_as_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn first_attr(el: &ElementRef<'_>, names: &[String]) -> Option<String> {
    for name in names {
        if let Some(v) = el.value().attr(name) {
            let v = v.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

fn nested_attr(el: &ElementRef<'_>, selector: &Selector, attr: &str) -> Option<String> {
    el.select(selector)
        .next()
        .and_then(|n| n.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// 运行范围的提取器：持有累积去重集与发现序号。
pub struct Extractor {
    provider: String,
    strategy: ExtractionStrategy,
    seen: HashSet<String>,
    next_index: usize,
}

impl Extractor {
    /// 校验已保证 extraction 存在且选择器合法。
    pub fn new(descriptor: &ProviderDescriptor) -> Result<Self, String> {
        let strategy = descriptor
            .extraction
            .clone()
            .ok_or_else(|| "extraction 未配置".to_string())?;
        Ok(Self {
            provider: descriptor.name.clone(),
            strategy,
            seen: HashSet::new(),
            next_index: 0,
        })
    }

    pub fn seen_count(&self) -> usize {
        self.seen.len()
    }

    /// 对一个页面快照做一轮提取。`page_url` 用于解析相对地址（baseUrl 优先）。
    /// 逐元素失败只上报日志，不中断。返回本轮新增（未重复）的候选。
    pub fn extract(
        &mut self,
        html: &str,
        page_url: &Url,
        emitter: &RunEmitter,
    ) -> Vec<CandidateItem> {
        let document = Html::parse_document(html);
        let mut out = Vec::new();

        match self.strategy.clone() {
            ExtractionStrategy::Attribute {
                selector,
                attributes,
                filters,
            } => {
                let sel = match Selector::parse(&selector) {
                    Ok(s) => s,
                    Err(_) => return out,
                };
                for el in document.select(&sel) {
                    let Some(value) = first_attr(&el, &attributes) else {
                        continue;
                    };
                    if !passes_filters(&value, &filters) {
                        continue;
                    }
                    self.push_candidate(&mut out, &value, Some(page_url), |id| CandidateItem {
                        id,
                        thumbnail_url: Some(value.clone()),
                        detail_url: None,
                        title: None,
                        index: 0,
                        provider: String::new(),
                    }, emitter);
                }
            }
            ExtractionStrategy::LinkCollection { selector, base_url } => {
                let sel = match Selector::parse(&selector) {
                    Ok(s) => s,
                    Err(_) => return out,
                };
                let base = base_url
                    .as_deref()
                    .and_then(|b| Url::parse(b).ok())
                    .unwrap_or_else(|| page_url.clone());
                for el in document.select(&sel) {
                    let Some(href) = el.value().attr("href").map(str::trim).filter(|h| !h.is_empty())
                    else {
                        continue;
                    };
                    let Ok(resolved) = base.join(href) else {
                        emitter.emit_task_log(
                            "warn",
                            format!("[extract] 链接无法解析，已跳过: {}", href),
                        );
                        continue;
                    };
                    let resolved = resolved.to_string();
                    self.push_candidate(&mut out, &resolved, None, |id| CandidateItem {
                        id,
                        thumbnail_url: None,
                        detail_url: Some(resolved.clone()),
                        title: None,
                        index: 0,
                        provider: String::new(),
                    }, emitter);
                }
            }
            ExtractionStrategy::JsonAttribute {
                selector,
                attribute,
                json_path: path,
                fallback_attribute,
            } => {
                let sel = match Selector::parse(&selector) {
                    Ok(s) => s,
                    Err(_) => return out,
                };
                for el in document.select(&sel) {
                    let value = el
                        .value()
                        .attr(&attribute)
                        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
                        .and_then(|v| json_path(&v, &path).and_then(json_value_as_string));
                    // JSON 解析或路径失败：尝试 fallback 属性，否则丢弃该元素
                    let value = match value {
                        Some(v) => v,
                        None => match fallback_attribute
                            .as_deref()
                            .and_then(|fb| el.value().attr(fb))
                            .map(str::trim)
                            .filter(|v| !v.is_empty())
                        {
                            Some(v) => v.to_string(),
                            None => continue,
                        },
                    };
                    self.push_candidate(&mut out, &value, Some(page_url), |id| CandidateItem {
                        id,
                        thumbnail_url: Some(value.clone()),
                        detail_url: None,
                        title: None,
                        index: 0,
                        provider: String::new(),
                    }, emitter);
                }
            }
            ExtractionStrategy::AttributeCollection {
                selector,
                link_attribute,
                base_url,
                thumbnail_selector,
                thumbnail_attribute,
                title_selector,
                title_attribute,
            } => {
                let sel = match Selector::parse(&selector) {
                    Ok(s) => s,
                    Err(_) => return out,
                };
                let thumb_sel = thumbnail_selector.as_deref().and_then(|s| Selector::parse(s).ok());
                let title_sel = title_selector.as_deref().and_then(|s| Selector::parse(s).ok());
                let base = base_url
                    .as_deref()
                    .and_then(|b| Url::parse(b).ok())
                    .unwrap_or_else(|| page_url.clone());
                for el in document.select(&sel) {
                    let Some(link) = el
                        .value()
                        .attr(&link_attribute)
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                    else {
                        continue;
                    };
                    let Ok(resolved) = base.join(link) else {
                        continue;
                    };
                    let resolved = resolved.to_string();
                    let thumbnail = match (&thumb_sel, &thumbnail_attribute) {
                        (Some(ts), Some(ta)) => nested_attr(&el, ts, ta),
                        _ => None,
                    };
                    let title = match (&title_sel, &title_attribute) {
                        (Some(ts), Some(ta)) => nested_attr(&el, ts, ta),
                        _ => None,
                    };
                    self.push_candidate(&mut out, &resolved, None, |id| CandidateItem {
                        id,
                        thumbnail_url: thumbnail.clone(),
                        detail_url: Some(resolved.clone()),
                        title: title.clone(),
                        index: 0,
                        provider: String::new(),
                    }, emitter);
                }
            }
        }

        out
    }

    fn push_candidate<F>(
        &mut self,
        out: &mut Vec<CandidateItem>,
        reference: &str,
        base: Option<&Url>,
        build: F,
        emitter: &RunEmitter,
    ) where
        F: FnOnce(String) -> CandidateItem,
    {
        let id = match normalize_url(reference, base) {
            Ok(id) => id,
            Err(e) => {
                emitter.emit_task_log("warn", format!("[extract] {}", e));
                return;
            }
        };
        if !self.seen.insert(id.clone()) {
            return;
        }
        let mut item = build(id);
        item.index = self.next_index;
        item.provider = self.provider.clone();
        self.next_index += 1;
        out.push(item);
    }
}
