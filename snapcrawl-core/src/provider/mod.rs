//! 提供方描述文件（provider descriptor）：声明式地描述一个站点如何搜索、
//! 翻页、提取与解析原图。加载时一次性解析为封闭的 tagged-union 变体并严格校验，
//! 未知的 type 标签、缺失/歧义字段都在任何网络调用之前报 ConfigError。

use crate::browser::WaitUntil;
use crate::error::CrawlError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use url::Url;

fn default_nav_timeout_ms() -> u64 {
    15000
}

fn default_max_scrolls() -> u32 {
    10
}

fn default_scroll_delay_ms() -> u64 {
    800
}

fn default_no_new_images_retries() -> u32 {
    3
}

fn default_load_more_timeout_ms() -> u64 {
    5000
}

fn default_wait_timeout_ms() -> u64 {
    5000
}

fn default_lightbox_fallback_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationConfig {
    #[serde(default)]
    pub wait_until: WaitUntil,
    #[serde(default = "default_nav_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for NavigationConfig {
    fn default() -> Self {
        Self {
            wait_until: WaitUntil::default(),
            timeout_ms: default_nav_timeout_ms(),
        }
    }
}

/// 查询串变换，按声明顺序应用。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryTransform {
    Lowercase,
    Uppercase,
    Trim,
    SpacesToHyphens,
    SpacesToPlus,
    UrlEncode,
}

/// 翻页/滚动策略。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ScrollStrategy {
    /// 滚到底、等待、采样可见条目数；连续 noNewImagesRetries 轮无增长则提前结束。
    InfiniteScroll {
        #[serde(default = "default_max_scrolls")]
        max_scrolls: u32,
        #[serde(default = "default_scroll_delay_ms")]
        scroll_delay_ms: u64,
        #[serde(default = "default_no_new_images_retries")]
        no_new_images_retries: u32,
    },
    /// 优先点"加载更多"按钮，按钮不存在时退化为一次滚动。
    LoadMoreButtonOrScroll {
        button_selector: String,
        #[serde(default = "default_max_scrolls")]
        max_attempts: u32,
        #[serde(default = "default_load_more_timeout_ms")]
        load_more_timeout_ms: u64,
        #[serde(default = "default_scroll_delay_ms")]
        scroll_delay_ms: u64,
    },
    /// 反复点击"下一页/更多"控件直到消失或达到 maxScrolls；0 表示单轮且不点击。
    Manual {
        next_selector: String,
        #[serde(default)]
        max_scrolls: u32,
    },
    /// 恰好一轮，不循环。
    None,
}

impl Default for ScrollStrategy {
    fn default() -> Self {
        ScrollStrategy::None
    }
}

/// 候选提取编码。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ExtractionStrategy {
    /// 按属性优先级取第一个非空值；`!` 前缀的过滤串为排除。
    Attribute {
        selector: String,
        attributes: Vec<String>,
        #[serde(default)]
        filters: Vec<String>,
    },
    /// 收集链接，相对地址按 baseUrl 解析；候选只带详情页 URL。
    LinkCollection {
        selector: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// 把指定属性按 JSON 解析并读取点分路径（如 `murl`）；失败时尝试 fallback 属性。
    JsonAttribute {
        selector: String,
        attribute: String,
        json_path: String,
        #[serde(default)]
        fallback_attribute: Option<String>,
    },
    /// 同 link_collection，另从嵌套元素读缩略图/标题属性（字段成对出现，缺一即拒绝）。
    AttributeCollection {
        selector: String,
        link_attribute: String,
        #[serde(default)]
        base_url: Option<String>,
        #[serde(default)]
        thumbnail_selector: Option<String>,
        #[serde(default)]
        thumbnail_attribute: Option<String>,
        #[serde(default)]
        title_selector: Option<String>,
        #[serde(default)]
        title_attribute: Option<String>,
    },
}

/// detail_page 的等待方式。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum DetailWait {
    /// 等待单个选择器在超时内可见。
    Locator {
        selector: String,
        #[serde(default = "default_wait_timeout_ms")]
        timeout_ms: u64,
    },
    /// 按顺序尝试多个选择器（各自超时），第一个成功者生效。
    LocatorAny { selectors: Vec<LocatorEntry> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocatorEntry {
    pub selector: String,
    #[serde(default = "default_wait_timeout_ms")]
    pub timeout_ms: u64,
}

/// 原图解析策略。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum FullSizeStrategy {
    /// 提取到的引用即为最终 URL。
    Direct,
    /// 进入详情页，等待后读取属性。
    DetailPage {
        wait: DetailWait,
        attribute: String,
        #[serde(default)]
        base_url: Option<String>,
    },
    /// 点击目标打开灯箱，等待任一图片选择器可见；超时则退化为固定延时后读 src。
    /// clickSelector 缺省表示不点击——用于导航到详情页后灯箱已直接展开的站点。
    Lightbox {
        #[serde(default)]
        click_selector: Option<String>,
        image_selectors: Vec<String>,
        #[serde(default = "default_wait_timeout_ms")]
        timeout_ms: u64,
        #[serde(default = "default_lightbox_fallback_ms")]
        fallback_delay_ms: u64,
    },
    /// 从候选 URL 的 query 中取出指定参数，可选 URI 解码；参数缺失视为解析失败。
    UrlParamDecode {
        param_name: String,
        #[serde(default)]
        decode: bool,
    },
    /// 从候选 URL 中剔除声明的 query 参数，返回剩余部分。
    UrlCleaning { remove_params: Vec<String> },
}

impl Default for FullSizeStrategy {
    fn default() -> Self {
        FullSizeStrategy::Direct
    }
}

/// 一个提供方的完整描述。加载校验通过后不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    /// API 模式：由外部 API 客户端处理，本引擎只做密钥校验并拒绝运行。
    #[serde(default)]
    pub api_mode: bool,
    #[serde(default)]
    pub requires_api_key: Option<bool>,
    #[serde(default)]
    pub api_key: Option<String>,
    /// 搜索 URL 模板，含 `{query}` 与可选命名占位符（从 searchParams 填充）。
    #[serde(default)]
    pub search_url_template: Option<String>,
    #[serde(default)]
    pub search_params: HashMap<String, String>,
    #[serde(default)]
    pub query_transforms: Vec<QueryTransform>,
    /// consent/cookie 弹窗的关闭按钮选择器，按序 best-effort 点击。
    #[serde(default)]
    pub consent_selectors: Vec<String>,
    #[serde(default)]
    pub navigation: NavigationConfig,
    /// 请求附带的 HTTP 头（下载与静态会话共用）。
    #[serde(default)]
    pub http_headers: HashMap<String, String>,
    #[serde(default)]
    pub scrolling: ScrollStrategy,
    #[serde(default)]
    pub extraction: Option<ExtractionStrategy>,
    #[serde(default)]
    pub full_size: FullSizeStrategy,
}

fn check_selector(errors: &mut Vec<String>, field: &str, selector: &str) {
    if selector.trim().is_empty() {
        errors.push(format!("{}: 选择器为空", field));
        return;
    }
    if scraper::Selector::parse(selector).is_err() {
        errors.push(format!("{}: 无效的 CSS 选择器 '{}'", field, selector));
    }
}

fn check_base_url(errors: &mut Vec<String>, field: &str, base: &Option<String>) {
    if let Some(b) = base {
        if Url::parse(b).is_err() {
            errors.push(format!("{}: baseUrl 无法解析 '{}'", field, b));
        }
    }
}

/// 扫描模板中的 `{name}` 占位符。
fn template_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = template[i + 1..].find('}') {
                let name = &template[i + 1..i + 1 + end];
                if !name.is_empty() {
                    out.push(name.to_string());
                }
                i += end + 2;
                continue;
            }
        }
        i += 1;
    }
    out
}

impl ProviderDescriptor {
    /// 严格校验：收集全部缺失/无效字段，一次性报 ConfigError。
    /// 必须在任何浏览器/网络调用之前完成。
    pub fn validate(&self) -> Result<(), CrawlError> {
        let mut errors: Vec<String> = Vec::new();

        if self.name.trim().is_empty() {
            errors.push("name: 不能为空".to_string());
        }

        if self.api_mode {
            match self.requires_api_key {
                None => errors.push("requiresApiKey: API 模式必须显式声明".to_string()),
                Some(true) => {
                    if self.api_key.as_deref().map_or(true, |k| k.trim().is_empty()) {
                        errors.push("apiKey: 该提供方要求密钥但未配置".to_string());
                    }
                }
                Some(false) => {}
            }
        } else {
            match self.search_url_template.as_deref() {
                None => errors.push("searchUrlTemplate: 抓取模式必须配置".to_string()),
                Some(t) if t.trim().is_empty() => {
                    errors.push("searchUrlTemplate: 不能为空".to_string())
                }
                Some(t) => {
                    let placeholders = template_placeholders(t);
                    if !placeholders.iter().any(|p| p == "query") {
                        errors.push("searchUrlTemplate: 缺少 {query} 占位符".to_string());
                    }
                    for p in &placeholders {
                        if p != "query" && !self.search_params.contains_key(p) {
                            errors.push(format!(
                                "searchParams: 占位符 {{{}}} 没有对应的取值",
                                p
                            ));
                        }
                    }
                }
            }
            if self.extraction.is_none() {
                errors.push("extraction: 抓取模式必须配置提取策略".to_string());
            }
        }

        for (i, sel) in self.consent_selectors.iter().enumerate() {
            check_selector(&mut errors, &format!("consentSelectors[{}]", i), sel);
        }

        match &self.scrolling {
            ScrollStrategy::LoadMoreButtonOrScroll { button_selector, .. } => {
                check_selector(&mut errors, "scrolling.buttonSelector", button_selector);
            }
            ScrollStrategy::Manual { next_selector, .. } => {
                check_selector(&mut errors, "scrolling.nextSelector", next_selector);
            }
            _ => {}
        }

        if let Some(extraction) = &self.extraction {
            match extraction {
                ExtractionStrategy::Attribute {
                    selector,
                    attributes,
                    ..
                } => {
                    check_selector(&mut errors, "extraction.selector", selector);
                    if attributes.is_empty() {
                        errors.push("extraction.attributes: 属性优先级列表不能为空".to_string());
                    }
                }
                ExtractionStrategy::LinkCollection { selector, base_url } => {
                    check_selector(&mut errors, "extraction.selector", selector);
                    check_base_url(&mut errors, "extraction", base_url);
                }
                ExtractionStrategy::JsonAttribute {
                    selector,
                    attribute,
                    json_path,
                    ..
                } => {
                    check_selector(&mut errors, "extraction.selector", selector);
                    if attribute.trim().is_empty() {
                        errors.push("extraction.attribute: 不能为空".to_string());
                    }
                    if json_path.trim().is_empty() {
                        errors.push("extraction.jsonPath: 不能为空".to_string());
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
                    check_selector(&mut errors, "extraction.selector", selector);
                    if link_attribute.trim().is_empty() {
                        errors.push("extraction.linkAttribute: 不能为空".to_string());
                    }
                    check_base_url(&mut errors, "extraction", base_url);
                    // 歧义描述直接拒绝，不做猜测
                    if thumbnail_selector.is_some() != thumbnail_attribute.is_some() {
                        errors.push(
                            "extraction: thumbnailSelector 与 thumbnailAttribute 必须成对出现"
                                .to_string(),
                        );
                    }
                    if title_selector.is_some() != title_attribute.is_some() {
                        errors.push(
                            "extraction: titleSelector 与 titleAttribute 必须成对出现".to_string(),
                        );
                    }
                    if let Some(sel) = thumbnail_selector {
                        check_selector(&mut errors, "extraction.thumbnailSelector", sel);
                    }
                    if let Some(sel) = title_selector {
                        check_selector(&mut errors, "extraction.titleSelector", sel);
                    }
                }
            }
        }

        match &self.full_size {
            FullSizeStrategy::Direct => {}
            FullSizeStrategy::DetailPage {
                wait,
                attribute,
                base_url,
            } => {
                if attribute.trim().is_empty() {
                    errors.push("fullSize.attribute: 不能为空".to_string());
                }
                check_base_url(&mut errors, "fullSize", base_url);
                match wait {
                    DetailWait::Locator { selector, .. } => {
                        check_selector(&mut errors, "fullSize.wait.selector", selector);
                    }
                    DetailWait::LocatorAny { selectors } => {
                        if selectors.is_empty() {
                            errors.push("fullSize.wait.selectors: 不能为空".to_string());
                        }
                        for (i, entry) in selectors.iter().enumerate() {
                            check_selector(
                                &mut errors,
                                &format!("fullSize.wait.selectors[{}]", i),
                                &entry.selector,
                            );
                        }
                    }
                }
            }
            FullSizeStrategy::Lightbox {
                click_selector,
                image_selectors,
                ..
            } => {
                if let Some(sel) = click_selector {
                    check_selector(&mut errors, "fullSize.clickSelector", sel);
                }
                if image_selectors.is_empty() {
                    errors.push("fullSize.imageSelectors: 不能为空".to_string());
                }
                for (i, sel) in image_selectors.iter().enumerate() {
                    check_selector(&mut errors, &format!("fullSize.imageSelectors[{}]", i), sel);
                }
            }
            FullSizeStrategy::UrlParamDecode { param_name, .. } => {
                if param_name.trim().is_empty() {
                    errors.push("fullSize.paramName: 不能为空".to_string());
                }
            }
            FullSizeStrategy::UrlCleaning { remove_params } => {
                if remove_params.is_empty() {
                    errors.push("fullSize.removeParams: 不能为空".to_string());
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(CrawlError::Config {
                provider: self.name.clone(),
                message: errors.join("; "),
            })
        }
    }

    /// 提取条目选择器（滚动引擎用于增长采样）。API 模式没有。
    pub fn item_selector(&self) -> Option<&str> {
        match &self.extraction {
            Some(ExtractionStrategy::Attribute { selector, .. })
            | Some(ExtractionStrategy::LinkCollection { selector, .. })
            | Some(ExtractionStrategy::JsonAttribute { selector, .. })
            | Some(ExtractionStrategy::AttributeCollection { selector, .. }) => Some(selector),
            None => None,
        }
    }
}

/// 已加载并通过校验的提供方集合。
#[derive(Default)]
pub struct ProviderRegistry {
    by_name: HashMap<String, Arc<ProviderDescriptor>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册一个描述。校验失败或重名都是 ConfigError。
    pub fn register(&mut self, descriptor: ProviderDescriptor) -> Result<(), CrawlError> {
        descriptor.validate()?;
        let name = descriptor.name.clone();
        if self.by_name.contains_key(&name) {
            return Err(CrawlError::Config {
                provider: name.clone(),
                message: format!("提供方 '{}' 已注册", name),
            });
        }
        self.by_name.insert(name, Arc::new(descriptor));
        Ok(())
    }

    /// 从 JSON 值加载。未知的策略 type 标签在这里变成 ConfigError。
    pub fn load_value(&mut self, value: serde_json::Value) -> Result<(), CrawlError> {
        let descriptor: ProviderDescriptor =
            serde_json::from_value(value).map_err(|e| CrawlError::Config {
                provider: String::new(),
                message: format!("描述文件解析失败: {}", e),
            })?;
        self.register(descriptor)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<(), CrawlError> {
        let text = fs::read_to_string(path).map_err(|e| CrawlError::Config {
            provider: String::new(),
            message: format!("读取描述文件失败 {}: {}", path.display(), e),
        })?;
        let value: serde_json::Value =
            serde_json::from_str(&text).map_err(|e| CrawlError::Config {
                provider: String::new(),
                message: format!("描述文件不是合法 JSON {}: {}", path.display(), e),
            })?;
        self.load_value(value)
    }

    pub fn get(&self, name: &str) -> Option<Arc<ProviderDescriptor>> {
        self.by_name.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut out: Vec<String> = self.by_name.keys().cloned().collect();
        out.sort();
        out
    }
}
