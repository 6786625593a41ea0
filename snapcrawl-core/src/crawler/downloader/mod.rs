//! 下载管线：有界队列 + 固定数量 worker。
//! 每个条目经过 取数 → 解码校验（尺寸/格式）→ 名额预留 → 持久化，
//! 跳过与失败都只影响该条目并计入计数器，不会中断整条管线。

pub mod http;

pub use http::{FetchedBytes, Fetcher, FileFetcher, HttpFetcher};

use crate::crawler::{CancelFlag, CrawlOptions, ImageStatus, ResolvedImage, RunCounters};
use crate::emitter::RunEmitter;
use crate::error::CrawlError;
use crate::image_type::{format_allowed, ImageInspector};
use crate::storage::{build_safe_filename, ImageSink};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

/// 管线共享上下文：协作方 + 计数器 + 取消信号 + 已持久化名额。
pub struct PipelineContext {
    pub provider: String,
    pub options: CrawlOptions,
    pub fetcher: Arc<dyn Fetcher>,
    pub inspector: Arc<dyn ImageInspector>,
    pub sink: Arc<dyn ImageSink>,
    pub counters: Arc<RunCounters>,
    pub emitter: RunEmitter,
    pub cancel: CancelFlag,
    /// 已成功持久化（或已预留名额）的条目数，用于严格执行 maxResults
    persisted: AtomicU32,
}

impl PipelineContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: impl Into<String>,
        options: CrawlOptions,
        fetcher: Arc<dyn Fetcher>,
        inspector: Arc<dyn ImageInspector>,
        sink: Arc<dyn ImageSink>,
        counters: Arc<RunCounters>,
        emitter: RunEmitter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            provider: provider.into(),
            options,
            fetcher,
            inspector,
            sink,
            counters,
            emitter,
            cancel,
            persisted: AtomicU32::new(0),
        }
    }

    pub fn persisted_count(&self) -> u32 {
        self.persisted.load(Ordering::SeqCst)
    }

    /// 预留一个持久化名额。已满返回 false。
    fn try_reserve_slot(&self) -> bool {
        loop {
            let cur = self.persisted.load(Ordering::SeqCst);
            if cur >= self.options.max_results {
                return false;
            }
            if self
                .persisted
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return true;
            }
        }
    }

    fn release_slot(&self) {
        self.persisted.fetch_sub(1, Ordering::SeqCst);
    }
}

/// 从 URL 中取出文件名提示（最后一段路径），取不到时用 "image"。
fn filename_hint(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|segs| segs.filter(|s| !s.is_empty()).last().map(str::to_string))
        })
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "image".to_string())
}

async fn process_one(ctx: &PipelineContext, mut image: ResolvedImage) {
    let url = match image.full_size_url.clone() {
        Some(u) => u,
        None => return,
    };

    if ctx.cancel.is_canceled() {
        ctx.emitter.emit_download_state(&url, "canceled", None);
        return;
    }

    ctx.emitter.emit_download_state(&url, "downloading", None);

    let fetched = match ctx.fetcher.fetch(&url, &ctx.cancel).await {
        Ok(f) => f,
        Err(e) => {
            if ctx.cancel.is_canceled() {
                ctx.emitter.emit_download_state(&url, "canceled", None);
                return;
            }
            image.advance(ImageStatus::Failed);
            ctx.counters.add_failed();
            let err = CrawlError::Download {
                provider: ctx.provider.clone(),
                url: url.clone(),
                message: e.clone(),
            };
            ctx.emitter.emit_task_error(&err);
            ctx.emitter.emit_download_state(&url, "failed", Some(&e));
            ctx.emitter
                .emit_progress(&ctx.provider, ctx.counters.snapshot());
            return;
        }
    };

    let meta = match ctx.inspector.inspect(&fetched.bytes) {
        Ok(m) => m,
        Err(e) => {
            // 解码失败是坏载荷（下载失败），validation 只指条件不满足的跳过
            image.advance(ImageStatus::Failed);
            ctx.counters.add_failed();
            let err = CrawlError::Download {
                provider: ctx.provider.clone(),
                url: url.clone(),
                message: e.clone(),
            };
            ctx.emitter.emit_task_error(&err);
            ctx.emitter.emit_download_state(&url, "failed", Some(&e));
            ctx.emitter
                .emit_progress(&ctx.provider, ctx.counters.snapshot());
            return;
        }
    };

    let opts = &ctx.options;
    if meta.width < opts.min_width || meta.height < opts.min_height {
        image.advance(ImageStatus::Skipped);
        ctx.counters.add_skipped();
        ctx.emitter.emit_task_log(
            "info",
            format!(
                "尺寸不足已跳过 {} ({}x{}, 要求 {}x{})",
                url, meta.width, meta.height, opts.min_width, opts.min_height
            ),
        );
        ctx.emitter.emit_download_state(&url, "skipped", None);
        ctx.emitter
            .emit_progress(&ctx.provider, ctx.counters.snapshot());
        return;
    }
    if !format_allowed(&meta.format, &opts.allowed_types) {
        image.advance(ImageStatus::Skipped);
        ctx.counters.add_skipped();
        ctx.emitter.emit_task_log(
            "info",
            format!("格式 {} 不在允许列表，已跳过 {}", meta.format, url),
        );
        ctx.emitter.emit_download_state(&url, "skipped", None);
        ctx.emitter
            .emit_progress(&ctx.provider, ctx.counters.snapshot());
        return;
    }

    // 校验通过后才占名额，名额严格等于最终落盘的文件数
    if !ctx.try_reserve_slot() {
        image.advance(ImageStatus::Skipped);
        ctx.counters.add_skipped();
        ctx.emitter.emit_download_state(&url, "skipped", None);
        return;
    }

    let hint = filename_hint(&fetched.final_url);
    let filename = build_safe_filename(&hint, &meta.format, &image.candidate.id);
    match ctx
        .sink
        .persist(&fetched.bytes, &opts.output_dir, &filename)
        .await
    {
        Ok(path) => {
            image.width = Some(meta.width);
            image.height = Some(meta.height);
            image.size_bytes = Some(fetched.bytes.len() as u64);
            image.local_path = Some(path);
            image.advance(ImageStatus::Downloaded);
            ctx.counters.add_downloaded();
            ctx.emitter.emit_download_state(&url, "completed", None);
            ctx.emitter
                .emit_progress(&ctx.provider, ctx.counters.snapshot());
        }
        Err(e) => {
            ctx.release_slot();
            image.advance(ImageStatus::Failed);
            ctx.counters.add_failed();
            let err = CrawlError::Download {
                provider: ctx.provider.clone(),
                url: url.clone(),
                message: e.clone(),
            };
            ctx.emitter.emit_task_error(&err);
            ctx.emitter.emit_download_state(&url, "failed", Some(&e));
            ctx.emitter
                .emit_progress(&ctx.provider, ctx.counters.snapshot());
        }
    }
}

/// 有界队列 + N 个 worker 的下载管线。
pub struct DownloadPipeline {
    tx: Option<mpsc::Sender<ResolvedImage>>,
    workers: Vec<JoinHandle<()>>,
}

impl DownloadPipeline {
    pub fn spawn(ctx: Arc<PipelineContext>) -> Self {
        let concurrency = ctx.options.concurrency.max(1) as usize;
        let (tx, rx) = mpsc::channel::<ResolvedImage>(concurrency * 2);
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = Vec::with_capacity(concurrency);
        for _ in 0..concurrency {
            let ctx = Arc::clone(&ctx);
            let rx = Arc::clone(&rx);
            workers.push(tokio::spawn(async move {
                loop {
                    let job = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    match job {
                        Some(image) => process_one(&ctx, image).await,
                        None => break,
                    }
                }
            }));
        }

        Self {
            tx: Some(tx),
            workers,
        }
    }

    /// 提交一个已解析条目。队列满时挂起（背压）。管线已关闭返回 false。
    pub async fn submit(&self, image: ResolvedImage) -> bool {
        match &self.tx {
            Some(tx) => tx.send(image).await.is_ok(),
            None => false,
        }
    }

    /// 关闭入口并等待全部 worker 排空队列。
    pub async fn finish(mut self) {
        self.tx.take();
        for handle in self.workers.drain(..) {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::CandidateItem;
    use crate::image_type::DefaultInspector;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        use image::{ImageOutputFormat, RgbImage};
        let img = RgbImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    struct StubFetcher {
        responses: HashMap<String, Result<Vec<u8>, String>>,
    }

    #[async_trait]
    impl Fetcher for StubFetcher {
        async fn fetch(&self, url: &str, _cancel: &CancelFlag) -> Result<FetchedBytes, String> {
            match self.responses.get(url) {
                Some(Ok(bytes)) => Ok(FetchedBytes {
                    bytes: bytes.clone(),
                    final_url: url.to_string(),
                    content_type: None,
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err("no response scripted".to_string()),
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        files: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ImageSink for MemorySink {
        async fn persist(
            &self,
            _bytes: &[u8],
            dir: &Path,
            filename: &str,
        ) -> Result<PathBuf, String> {
            self.files.lock().unwrap().push(filename.to_string());
            Ok(dir.join(filename))
        }
    }

    fn resolved(url: &str) -> ResolvedImage {
        let mut img = ResolvedImage::pending(CandidateItem {
            id: url.to_string(),
            thumbnail_url: Some(url.to_string()),
            detail_url: None,
            title: None,
            index: 0,
            provider: "t".to_string(),
        });
        img.full_size_url = Some(url.to_string());
        img.advance(ImageStatus::Resolved);
        img
    }

    fn context(
        options: CrawlOptions,
        responses: HashMap<String, Result<Vec<u8>, String>>,
        sink: Arc<MemorySink>,
    ) -> (Arc<PipelineContext>, Arc<RunCounters>) {
        let counters = Arc::new(RunCounters::default());
        let (emitter, _rx) = RunEmitter::channel();
        let ctx = Arc::new(PipelineContext::new(
            "t",
            options,
            Arc::new(StubFetcher { responses }),
            Arc::new(DefaultInspector),
            sink,
            Arc::clone(&counters),
            emitter,
            CancelFlag::new(),
        ));
        (ctx, counters)
    }

    #[tokio::test]
    async fn test_pipeline_downloads_and_counts() {
        let mut responses = HashMap::new();
        responses.insert("https://a/1.png".to_string(), Ok(png_bytes(10, 10)));
        responses.insert("https://a/2.png".to_string(), Ok(png_bytes(10, 10)));
        let sink = Arc::new(MemorySink::default());
        let (ctx, counters) = context(CrawlOptions::new("/tmp/out"), responses, Arc::clone(&sink));

        let pipeline = DownloadPipeline::spawn(ctx);
        assert!(pipeline.submit(resolved("https://a/1.png")).await);
        assert!(pipeline.submit(resolved("https://a/2.png")).await);
        pipeline.finish().await;

        let snap = counters.snapshot();
        assert_eq!(snap.downloaded, 2);
        assert_eq!(snap.failed, 0);
        assert_eq!(sink.files.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_min_width_skips_without_persisting() {
        let mut responses = HashMap::new();
        responses.insert("https://a/small.png".to_string(), Ok(png_bytes(3, 2)));
        let sink = Arc::new(MemorySink::default());
        let mut options = CrawlOptions::new("/tmp/out");
        options.min_width = 100;
        let (ctx, counters) = context(options, responses, Arc::clone(&sink));

        let pipeline = DownloadPipeline::spawn(ctx);
        pipeline.submit(resolved("https://a/small.png")).await;
        pipeline.finish().await;

        let snap = counters.snapshot();
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.downloaded, 0);
        assert!(sink.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_format_filter_skips() {
        let mut responses = HashMap::new();
        responses.insert("https://a/pic.png".to_string(), Ok(png_bytes(10, 10)));
        let sink = Arc::new(MemorySink::default());
        let mut options = CrawlOptions::new("/tmp/out");
        options.allowed_types = vec!["jpg".to_string()];
        let (ctx, counters) = context(options, responses, Arc::clone(&sink));

        let pipeline = DownloadPipeline::spawn(ctx);
        pipeline.submit(resolved("https://a/pic.png")).await;
        pipeline.finish().await;

        assert_eq!(counters.snapshot().skipped, 1);
        assert!(sink.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_results_caps_persisted_files() {
        let mut responses = HashMap::new();
        for i in 0..4 {
            responses.insert(format!("https://a/{}.png", i), Ok(png_bytes(10, 10)));
        }
        let sink = Arc::new(MemorySink::default());
        let mut options = CrawlOptions::new("/tmp/out");
        options.max_results = 2;
        let (ctx, counters) = context(options, responses, Arc::clone(&sink));

        let pipeline = DownloadPipeline::spawn(Arc::clone(&ctx));
        for i in 0..4 {
            pipeline.submit(resolved(&format!("https://a/{}.png", i))).await;
        }
        pipeline.finish().await;

        let snap = counters.snapshot();
        assert_eq!(snap.downloaded, 2);
        assert_eq!(snap.skipped, 2);
        assert_eq!(ctx.persisted_count(), 2);
        assert_eq!(sink.files.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fetch_failure_counts_failed() {
        let mut responses = HashMap::new();
        responses.insert(
            "https://a/bad.png".to_string(),
            Err("HTTP 404".to_string()),
        );
        responses.insert("https://a/garbage.png".to_string(), Ok(b"nope".to_vec()));
        let sink = Arc::new(MemorySink::default());
        let (ctx, counters) = context(CrawlOptions::new("/tmp/out"), responses, Arc::clone(&sink));

        let pipeline = DownloadPipeline::spawn(ctx);
        pipeline.submit(resolved("https://a/bad.png")).await;
        pipeline.submit(resolved("https://a/garbage.png")).await;
        pipeline.finish().await;

        let snap = counters.snapshot();
        assert_eq!(snap.failed, 2);
        assert_eq!(snap.downloaded, 0);
        assert!(sink.files.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_payload_reports_download_stage() {
        let mut responses = HashMap::new();
        responses.insert("https://a/garbage.png".to_string(), Ok(b"nope".to_vec()));
        let sink = Arc::new(MemorySink::default());
        let counters = Arc::new(RunCounters::default());
        let (emitter, mut rx) = RunEmitter::channel();
        let ctx = Arc::new(PipelineContext::new(
            "t",
            CrawlOptions::new("/tmp/out"),
            Arc::new(StubFetcher { responses }),
            Arc::new(DefaultInspector),
            Arc::clone(&sink) as Arc<dyn ImageSink>,
            Arc::clone(&counters),
            emitter,
            CancelFlag::new(),
        ));

        let pipeline = DownloadPipeline::spawn(ctx);
        pipeline.submit(resolved("https://a/garbage.png")).await;
        pipeline.finish().await;

        assert_eq!(counters.snapshot().failed, 1);
        assert_eq!(counters.snapshot().skipped, 0);
        let mut stages = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            if let crate::emitter::CrawlEvent::TaskError { stage, .. } = ev {
                stages.push(stage);
            }
        }
        assert_eq!(stages, vec!["download".to_string()]);
    }

    /// 第一次取数时翻转取消信号的协作方。
    struct CancelingFetcher {
        bytes: Vec<u8>,
        fetches: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl Fetcher for CancelingFetcher {
        async fn fetch(&self, url: &str, cancel: &CancelFlag) -> Result<FetchedBytes, String> {
            self.fetches
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            cancel.cancel();
            Ok(FetchedBytes {
                bytes: self.bytes.clone(),
                final_url: url.to_string(),
                content_type: None,
            })
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_pipeline_stops_remaining_items() {
        let fetcher = Arc::new(CancelingFetcher {
            bytes: png_bytes(10, 10),
            fetches: std::sync::atomic::AtomicU32::new(0),
        });
        let sink = Arc::new(MemorySink::default());
        let counters = Arc::new(RunCounters::default());
        let (emitter, _rx) = RunEmitter::channel();
        let mut options = CrawlOptions::new("/tmp/out");
        // 单 worker：第二个条目必然在取消之后才出队
        options.concurrency = 1;
        let ctx = Arc::new(PipelineContext::new(
            "t",
            options,
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
            Arc::new(DefaultInspector),
            Arc::clone(&sink) as Arc<dyn ImageSink>,
            Arc::clone(&counters),
            emitter,
            CancelFlag::new(),
        ));

        let pipeline = DownloadPipeline::spawn(ctx);
        pipeline.submit(resolved("https://a/1.png")).await;
        pipeline.submit(resolved("https://a/2.png")).await;
        pipeline.finish().await;

        // 第一条已经在途，照常完成；第二条不再取数也不计入失败/跳过
        let snap = counters.snapshot();
        assert_eq!(snap.downloaded, 1);
        assert_eq!(snap.failed, 0);
        assert_eq!(snap.skipped, 0);
        assert_eq!(fetcher.fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(sink.files.lock().unwrap().len(), 1);
    }
}
