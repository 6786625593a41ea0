//! 爬取运行的共享类型：运行参数、计数器、取消信号、候选条目与其状态机。

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub mod coordinator;
pub mod downloader;
pub mod extract;
pub mod local_import;
pub mod resolve;
pub mod scroll;
pub mod session;

fn default_max_results() -> u32 {
    60
}

fn default_concurrency() -> u32 {
    5
}

/// 单次运行的选项（对应前端/CLI 的任务配置）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrawlOptions {
    pub output_dir: PathBuf,
    #[serde(default = "default_max_results")]
    pub max_results: u32,
    #[serde(default)]
    pub min_width: u32,
    #[serde(default)]
    pub min_height: u32,
    /// 允许的图片扩展名（小写，不含点）；空表示使用内置支持列表。
    #[serde(default)]
    pub allowed_types: Vec<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,
    /// 整个运行的时间预算（毫秒），超过后在下一个挂起点停止。
    #[serde(default)]
    pub time_budget_ms: Option<u64>,
}

impl CrawlOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            max_results: default_max_results(),
            min_width: 0,
            min_height: 0,
            allowed_types: Vec::new(),
            concurrency: default_concurrency(),
            time_budget_ms: None,
        }
    }
}

/// 运行范围的取消信号：在每个挂起点检查（滚动迭代开始、解析前、下载派发前）。
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// 运行计数器。原子更新，随 progress 事件快照上报。
#[derive(Debug, Default)]
pub struct RunCounters {
    found: AtomicU32,
    downloaded: AtomicU32,
    skipped: AtomicU32,
    failed: AtomicU32,
}

impl RunCounters {
    pub fn add_found(&self, n: u32) {
        self.found.fetch_add(n, Ordering::SeqCst);
    }

    pub fn add_downloaded(&self) {
        self.downloaded.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::SeqCst);
    }

    pub fn add_failed(&self) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            found: self.found.load(Ordering::SeqCst),
            downloaded: self.downloaded.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CounterSnapshot {
    pub found: u32,
    pub downloaded: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// 终态摘要。每次运行恰好发出一次（complete 事件）。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    /// 运行标识（uuid v4），事件消费方用于区分并发运行
    pub run_id: String,
    pub provider: String,
    pub query: String,
    pub counters: CounterSnapshot,
    pub canceled: bool,
    pub elapsed_ms: u64,
    /// 任务级失败（配置/导航）时的错误信息；逐条目失败不在此处。
    #[serde(default)]
    pub error: Option<String>,
}

/// 提取阶段产出的候选条目。创建后不再修改。
/// id 为规范化后的绝对 URL（scheme+host+path+排序后的 query），同时是去重键。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    pub id: String,
    pub thumbnail_url: Option<String>,
    pub detail_url: Option<String>,
    pub title: Option<String>,
    /// 发现顺序（运行内递增）
    pub index: usize,
    pub provider: String,
}

impl CandidateItem {
    /// 提取到的原始引用（direct / url_param_decode / url_cleaning 的输入）。
    pub fn primary_reference(&self) -> Option<&str> {
        self.thumbnail_url.as_deref().or(self.detail_url.as_deref())
    }
}

/// 条目状态，只允许向前推进，不允许回退。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ImageStatus {
    Pending,
    Resolved,
    Downloaded,
    Skipped,
    Failed,
}

impl ImageStatus {
    fn rank(&self) -> u8 {
        match self {
            ImageStatus::Pending => 0,
            ImageStatus::Resolved => 1,
            // Downloaded / Skipped / Failed 均为终态
            ImageStatus::Downloaded | ImageStatus::Skipped | ImageStatus::Failed => 2,
        }
    }
}

/// 解析/下载过程中的条目。引用一个 [CandidateItem]。
#[derive(Debug, Clone)]
pub struct ResolvedImage {
    pub candidate: CandidateItem,
    pub full_size_url: Option<String>,
    pub status: ImageStatus,
    pub failure: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub size_bytes: Option<u64>,
    pub local_path: Option<PathBuf>,
}

impl ResolvedImage {
    pub fn pending(candidate: CandidateItem) -> Self {
        Self {
            candidate,
            full_size_url: None,
            status: ImageStatus::Pending,
            failure: None,
            width: None,
            height: None,
            size_bytes: None,
            local_path: None,
        }
    }

    /// 推进状态。只向前，回退会被拒绝并返回 false。
    pub fn advance(&mut self, next: ImageStatus) -> bool {
        if next.rank() < self.status.rank() || (self.status.rank() == 2 && next != self.status) {
            return false;
        }
        self.status = next;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> CandidateItem {
        CandidateItem {
            id: id.to_string(),
            thumbnail_url: Some(id.to_string()),
            detail_url: None,
            title: None,
            index: 0,
            provider: "test".to_string(),
        }
    }

    #[test]
    fn test_status_only_moves_forward() {
        let mut img = ResolvedImage::pending(candidate("https://a/b"));
        assert!(img.advance(ImageStatus::Resolved));
        assert!(img.advance(ImageStatus::Downloaded));
        // 终态后不允许再变
        assert!(!img.advance(ImageStatus::Pending));
        assert!(!img.advance(ImageStatus::Failed));
        assert_eq!(img.status, ImageStatus::Downloaded);
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        let clone = flag.clone();
        assert!(!clone.is_canceled());
        flag.cancel();
        assert!(clone.is_canceled());
    }

    #[test]
    fn test_counters_snapshot() {
        let c = RunCounters::default();
        c.add_found(3);
        c.add_downloaded();
        c.add_skipped();
        let snap = c.snapshot();
        assert_eq!(snap.found, 3);
        assert_eq!(snap.downloaded, 1);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.failed, 0);
    }
}
