//! 浏览器表面：引擎对页面会话的全部依赖都收敛到 [BrowserSession] trait。
//! 会话是单写者资源，同一时刻只允许一个未完成的导航/滚动/读取操作，
//! 由协调器以 `&mut dyn BrowserSession` 独占持有来保证。
//!
//! [StaticSession] 是内置的 reqwest 实现：抓取静态 HTML（无 JS 执行），
//! 滚动为空操作、点击报告元素不存在——靠滚动引擎的"无增长即终止"规则自然收敛。

use crate::error::BrowserError;
use crate::settings::{create_client, EngineSettings};
use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

/// 导航等待策略（对应 descriptor 的 navigation.waitUntil）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum WaitUntil {
    DomContentLoaded,
    #[default]
    Load,
    NetworkIdle,
}

#[async_trait]
pub trait BrowserSession: Send {
    /// 导航到 url 并按策略等待页面就绪。
    async fn navigate(
        &mut self,
        url: &Url,
        wait: WaitUntil,
        timeout: Duration,
    ) -> Result<(), BrowserError>;

    async fn current_url(&mut self) -> Result<Url, BrowserError>;

    /// 当前页面快照的 HTML。提取全部基于该快照解析。
    async fn page_html(&mut self) -> Result<String, BrowserError>;

    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError>;

    /// 点击第一个匹配元素。元素不存在返回 Ok(false)，不是错误。
    async fn click(&mut self, selector: &str, timeout: Duration) -> Result<bool, BrowserError>;

    /// 等待选择器变为可见。超时返回 Ok(false)。
    async fn wait_visible(
        &mut self,
        selector: &str,
        timeout: Duration,
    ) -> Result<bool, BrowserError>;

    /// 读取第一个匹配元素的属性；元素或属性不存在返回 Ok(None)。
    async fn read_attribute(
        &mut self,
        selector: &str,
        attr: &str,
        timeout: Duration,
    ) -> Result<Option<String>, BrowserError>;

    /// 统计当前可见的匹配元素数（滚动引擎用于增长采样）。
    async fn count_elements(&mut self, selector: &str) -> Result<usize, BrowserError> {
        let html = self.page_html().await?;
        let sel = Selector::parse(selector)
            .map_err(|e| BrowserError(format!("Invalid CSS selector: {}", e)))?;
        let document = Html::parse_document(&html);
        Ok(document.select(&sel).count())
    }
}

/// 静态页面会话：GET 抓取 + scraper 解析，手动跟随重定向（上限 10 跳）。
pub struct StaticSession {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    current: Option<Url>,
    html: String,
}

impl StaticSession {
    pub fn new(settings: &EngineSettings) -> Result<Self, BrowserError> {
        Ok(Self {
            client: create_client(settings).map_err(BrowserError)?,
            headers: HashMap::new(),
            current: None,
            html: String::new(),
        })
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    fn select_first_attr(&self, selector: &str, attr: &str) -> Result<Option<String>, BrowserError> {
        let sel = Selector::parse(selector)
            .map_err(|e| BrowserError(format!("Invalid CSS selector: {}", e)))?;
        let document = Html::parse_document(&self.html);
        Ok(document
            .select(&sel)
            .next()
            .and_then(|el| el.value().attr(attr))
            .map(|v| v.to_string()))
    }

    fn selector_present(&self, selector: &str) -> Result<bool, BrowserError> {
        let sel = Selector::parse(selector)
            .map_err(|e| BrowserError(format!("Invalid CSS selector: {}", e)))?;
        let document = Html::parse_document(&self.html);
        Ok(document.select(&sel).next().is_some())
    }
}

#[async_trait]
impl BrowserSession for StaticSession {
    async fn navigate(
        &mut self,
        url: &Url,
        _wait: WaitUntil,
        timeout: Duration,
    ) -> Result<(), BrowserError> {
        let mut current_url = url.clone();
        let mut redirect_count: u32 = 0;

        let resp = loop {
            let mut req = self.client.get(current_url.as_str()).timeout(timeout);
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            let r = req
                .send()
                .await
                .map_err(|e| BrowserError(format!("Failed to load page: {}", e)))?;

            if r.status().is_redirection() {
                if redirect_count >= 10 {
                    return Err(BrowserError("Too many redirects".to_string()));
                }
                if let Some(loc) = r.headers().get(reqwest::header::LOCATION) {
                    if let Ok(loc_str) = loc.to_str() {
                        if let Ok(new_url) = current_url.join(loc_str) {
                            current_url = new_url;
                            redirect_count += 1;
                            continue;
                        }
                    }
                }
            }
            break r;
        };

        let status = resp.status();
        if !status.is_success() {
            return Err(BrowserError(format!("HTTP error: {}", status)));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| BrowserError(format!("Failed to read page body: {}", e)))?;
        self.html = body;
        self.current = Some(current_url);
        Ok(())
    }

    async fn current_url(&mut self) -> Result<Url, BrowserError> {
        self.current
            .clone()
            .ok_or_else(|| BrowserError("No page loaded".to_string()))
    }

    async fn page_html(&mut self) -> Result<String, BrowserError> {
        Ok(self.html.clone())
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError> {
        // 静态页面没有滚动加载，空操作；无增长规则会让滚动循环尽快终止
        Ok(())
    }

    async fn click(&mut self, _selector: &str, _timeout: Duration) -> Result<bool, BrowserError> {
        // 无 JS，点击不可用；按"元素不存在"处理
        Ok(false)
    }

    async fn wait_visible(
        &mut self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<bool, BrowserError> {
        self.selector_present(selector)
    }

    async fn read_attribute(
        &mut self,
        selector: &str,
        attr: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, BrowserError> {
        self.select_first_attr(selector, attr)
    }
}
