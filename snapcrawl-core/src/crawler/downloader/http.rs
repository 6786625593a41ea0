//! 取数协作方：URL → bytes。
//! HTTP 实现手动跟随重定向（上限 10 跳），对 408/429/5xx 指数退避重试，
//! 分块读取响应体并在块间检查取消信号。

use crate::crawler::CancelFlag;
use crate::settings::{create_client, EngineSettings};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use url::Url;

/// 一次成功抓取的结果。
pub struct FetchedBytes {
    pub bytes: Vec<u8>,
    /// 跟随重定向后的最终 URL
    pub final_url: String,
    pub content_type: Option<String>,
}

#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, cancel: &CancelFlag) -> Result<FetchedBytes, String>;
}

const MAX_REDIRECTS: u32 = 10;

fn retry_backoff_ms(attempt: u32) -> u64 {
    (500u64).saturating_mul(2u64.saturating_pow(attempt)).min(5000)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    status == reqwest::StatusCode::REQUEST_TIMEOUT
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
}

pub struct HttpFetcher {
    client: reqwest::Client,
    headers: HashMap<String, String>,
    retry_count: u32,
}

impl HttpFetcher {
    pub fn new(
        settings: &EngineSettings,
        headers: HashMap<String, String>,
    ) -> Result<Self, String> {
        Ok(Self {
            client: create_client(settings)?,
            headers,
            retry_count: settings.retry_count,
        })
    }

    async fn fetch_once(
        &self,
        url: &str,
        cancel: &CancelFlag,
    ) -> Result<Result<FetchedBytes, String>, String> {
        // 外层 Err 表示不可重试的失败；内层 Err 表示可重试
        let mut current = Url::parse(url).map_err(|e| format!("Invalid URL '{}': {}", url, e))?;
        let mut redirects: u32 = 0;

        let resp = loop {
            if cancel.is_canceled() {
                return Err("任务已取消".to_string());
            }
            let mut req = self.client.get(current.as_str());
            for (k, v) in &self.headers {
                req = req.header(k.as_str(), v.as_str());
            }
            let r = match req.send().await {
                Ok(r) => r,
                // 连接/超时错误可重试
                Err(e) => return Ok(Err(format!("请求失败: {}", e))),
            };

            if r.status().is_redirection() {
                if redirects >= MAX_REDIRECTS {
                    return Err("重定向次数超限".to_string());
                }
                let loc = r
                    .headers()
                    .get(reqwest::header::LOCATION)
                    .and_then(|l| l.to_str().ok())
                    .and_then(|l| current.join(l).ok());
                match loc {
                    Some(next) => {
                        current = next;
                        redirects += 1;
                        continue;
                    }
                    None => return Err("重定向缺少有效 Location".to_string()),
                }
            }
            break r;
        };

        let status = resp.status();
        if !status.is_success() {
            let msg = format!("HTTP {}", status);
            return if is_retryable_status(status) {
                Ok(Err(msg))
            } else {
                Err(msg)
            };
        }

        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let mut bytes: Vec<u8> = Vec::new();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            if cancel.is_canceled() {
                return Err("任务已取消".to_string());
            }
            match chunk {
                Ok(c) => bytes.extend_from_slice(&c),
                // 传输中断可重试
                Err(e) => return Ok(Err(format!("读取响应失败: {}", e))),
            }
        }

        Ok(Ok(FetchedBytes {
            bytes,
            final_url: current.to_string(),
            content_type,
        }))
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, cancel: &CancelFlag) -> Result<FetchedBytes, String> {
        let mut last_err = String::new();
        for attempt in 0..=self.retry_count {
            if cancel.is_canceled() {
                return Err("任务已取消".to_string());
            }
            match self.fetch_once(url, cancel).await? {
                Ok(done) => return Ok(done),
                Err(retryable) => {
                    last_err = retryable;
                    if attempt < self.retry_count {
                        sleep(Duration::from_millis(retry_backoff_ms(attempt))).await;
                    }
                }
            }
        }
        Err(format!("重试耗尽: {}", last_err))
    }
}

/// 本地文件取数：local_import 与测试复用同一条管线。
pub struct FileFetcher;

#[async_trait]
impl Fetcher for FileFetcher {
    async fn fetch(&self, url: &str, _cancel: &CancelFlag) -> Result<FetchedBytes, String> {
        let path = url.strip_prefix("file://").unwrap_or(url);
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| format!("读取文件失败 {}: {}", path, e))?;
        Ok(FetchedBytes {
            bytes,
            final_url: url.to_string(),
            content_type: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps_at_five_seconds() {
        assert_eq!(retry_backoff_ms(0), 500);
        assert_eq!(retry_backoff_ms(1), 1000);
        assert_eq!(retry_backoff_ms(2), 2000);
        assert_eq!(retry_backoff_ms(10), 5000);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(reqwest::StatusCode::REQUEST_TIMEOUT));
        assert!(is_retryable_status(reqwest::StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable_status(reqwest::StatusCode::BAD_GATEWAY));
        assert!(!is_retryable_status(reqwest::StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(reqwest::StatusCode::FORBIDDEN));
    }

    #[tokio::test]
    async fn test_file_fetcher_reads_local_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, b"hello").unwrap();
        let out = FileFetcher
            .fetch(path.to_str().unwrap(), &CancelFlag::new())
            .await
            .unwrap();
        assert_eq!(out.bytes, b"hello");
    }
}
