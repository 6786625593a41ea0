//! 运行错误分类：只有配置错误与未恢复的导航错误会终止整个任务，
//! 其余全部降级为单条目的计数结果（skipped / failed）。

use serde::Serialize;
use thiserror::Error;

/// 错误发生的阶段，随事件一起上报，便于诊断。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Config,
    Navigation,
    Extraction,
    Resolution,
    Download,
    Validation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Config => "config",
            Stage::Navigation => "navigation",
            Stage::Extraction => "extraction",
            Stage::Resolution => "resolution",
            Stage::Download => "download",
            Stage::Validation => "validation",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum CrawlError {
    /// 描述文件无效。必须发生在任何网络/浏览器调用之前。
    #[error("[{provider}] 配置无效: {message}")]
    Config { provider: String, message: String },

    /// 页面加载/导航失败（重试耗尽后任务以失败结束）。
    #[error("[{provider}] 导航失败 ({url}): {message}")]
    Navigation {
        provider: String,
        url: String,
        message: String,
    },

    /// 选择器/解析未命中，按条目记录，任务继续。
    #[error("[{provider}] 提取失败 ({url}): {message}")]
    Extraction {
        provider: String,
        url: String,
        message: String,
    },

    /// 原图解析失败，跳过该候选。
    #[error("[{provider}] 原图解析失败 ({url}): {message}")]
    Resolution {
        provider: String,
        url: String,
        message: String,
    },

    /// 网络/HTTP 失败（退避重试耗尽后跳过）。
    #[error("[{provider}] 下载失败 ({url}): {message}")]
    Download {
        provider: String,
        url: String,
        message: String,
    },

    /// 尺寸/格式不满足条件，跳过，不算失败。
    #[error("[{provider}] 校验未通过 ({url}): {message}")]
    Validation {
        provider: String,
        url: String,
        message: String,
    },

    #[error("任务已取消")]
    Canceled,
}

impl CrawlError {
    pub fn stage(&self) -> Stage {
        match self {
            CrawlError::Config { .. } => Stage::Config,
            CrawlError::Navigation { .. } => Stage::Navigation,
            CrawlError::Extraction { .. } => Stage::Extraction,
            CrawlError::Resolution { .. } => Stage::Resolution,
            CrawlError::Download { .. } => Stage::Download,
            CrawlError::Validation { .. } => Stage::Validation,
            CrawlError::Canceled => Stage::Navigation,
        }
    }

    /// 是否应终止整个任务（其余错误均按条目降级）。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::Config { .. } | CrawlError::Navigation { .. } | CrawlError::Canceled
        )
    }

    pub fn provider(&self) -> Option<&str> {
        match self {
            CrawlError::Config { provider, .. }
            | CrawlError::Navigation { provider, .. }
            | CrawlError::Extraction { provider, .. }
            | CrawlError::Resolution { provider, .. }
            | CrawlError::Download { provider, .. }
            | CrawlError::Validation { provider, .. } => Some(provider),
            CrawlError::Canceled => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self {
            CrawlError::Navigation { url, .. }
            | CrawlError::Extraction { url, .. }
            | CrawlError::Resolution { url, .. }
            | CrawlError::Download { url, .. }
            | CrawlError::Validation { url, .. } => Some(url),
            _ => None,
        }
    }
}

/// 浏览器协作方边界错误：由调用处映射到对应阶段的 [CrawlError]。
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct BrowserError(pub String);

impl From<String> for BrowserError {
    fn from(s: String) -> Self {
        BrowserError(s)
    }
}

impl From<&str> for BrowserError {
    fn from(s: &str) -> Self {
        BrowserError(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        let config = CrawlError::Config {
            provider: "p".into(),
            message: "m".into(),
        };
        let download = CrawlError::Download {
            provider: "p".into(),
            url: "u".into(),
            message: "m".into(),
        };
        assert!(config.is_fatal());
        assert!(!download.is_fatal());
        assert_eq!(download.stage(), Stage::Download);
        assert_eq!(download.url(), Some("u"));
    }
}
