//! 运行协调器：校验 → 导航 → 滚动/提取循环 → 原图解析 → 下载管线排空 → 摘要。
//!
//! 会话由协调器以 `&mut dyn BrowserSession` 独占驱动；URL 变换类解析在循环内
//! 直接入队，与下载 worker 并行，导航类解析（detail_page / lightbox）积压到
//! 滚动结束后串行执行。无论正常结束、取消还是任务级失败，complete 事件
//! 恰好发出一次，且发出前管线必然已排空。

use crate::browser::BrowserSession;
use crate::crawler::downloader::{DownloadPipeline, Fetcher, HttpFetcher, PipelineContext};
use crate::crawler::extract::Extractor;
use crate::crawler::resolve::{needs_session, resolve_url_only, resolve_with_session};
use crate::crawler::scroll::ScrollEngine;
use crate::crawler::session::open_search_page;
use crate::crawler::{
    CancelFlag, CandidateItem, CrawlOptions, ImageStatus, ResolvedImage, RunCounters, RunSummary,
};
use crate::emitter::RunEmitter;
use crate::error::CrawlError;
use crate::image_type::{DefaultInspector, ImageInspector};
use crate::provider::ProviderDescriptor;
use crate::settings::EngineSettings;
use crate::storage::{FsImageSink, ImageSink};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub struct Coordinator {
    descriptor: Arc<ProviderDescriptor>,
    options: CrawlOptions,
    settings: EngineSettings,
    fetcher: Arc<dyn Fetcher>,
    inspector: Arc<dyn ImageInspector>,
    sink: Arc<dyn ImageSink>,
    emitter: RunEmitter,
    cancel: CancelFlag,
}

impl Coordinator {
    /// 显式注入全部协作方（测试与 local_import 用）。
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: Arc<ProviderDescriptor>,
        options: CrawlOptions,
        settings: EngineSettings,
        fetcher: Arc<dyn Fetcher>,
        inspector: Arc<dyn ImageInspector>,
        sink: Arc<dyn ImageSink>,
        emitter: RunEmitter,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            descriptor,
            options,
            settings,
            fetcher,
            inspector,
            sink,
            emitter,
            cancel,
        }
    }

    /// 默认协作方：HTTP 取数（带 descriptor 声明的请求头）、image 解码、文件系统落盘。
    pub fn with_defaults(
        descriptor: Arc<ProviderDescriptor>,
        options: CrawlOptions,
        settings: EngineSettings,
        emitter: RunEmitter,
        cancel: CancelFlag,
    ) -> Result<Self, CrawlError> {
        let fetcher = HttpFetcher::new(&settings, descriptor.http_headers.clone()).map_err(|e| {
            CrawlError::Config {
                provider: descriptor.name.clone(),
                message: e,
            }
        })?;
        Ok(Self::new(
            descriptor,
            options,
            settings,
            Arc::new(fetcher),
            Arc::new(DefaultInspector),
            Arc::new(FsImageSink),
            emitter,
            cancel,
        ))
    }

    /// 执行一次完整运行。始终返回摘要，并把同一份摘要作为 complete 事件发出。
    pub async fn run(self, session: &mut dyn BrowserSession, query: &str) -> RunSummary {
        let started = Instant::now();
        let counters = Arc::new(RunCounters::default());
        let ctx = Arc::new(PipelineContext::new(
            self.descriptor.name.clone(),
            self.options.clone(),
            Arc::clone(&self.fetcher),
            Arc::clone(&self.inspector),
            Arc::clone(&self.sink),
            Arc::clone(&counters),
            self.emitter.clone(),
            self.cancel.clone(),
        ));
        let pipeline = DownloadPipeline::spawn(Arc::clone(&ctx));

        let result = self
            .drive(session, query, &pipeline, &ctx, &counters)
            .await;

        // 摘要必须在队列排空后生成，否则计数不完整
        pipeline.finish().await;

        let canceled =
            self.cancel.is_canceled() || matches!(result, Err(CrawlError::Canceled));
        let error = match &result {
            Err(CrawlError::Canceled) => None,
            Err(e) => Some(e.to_string()),
            Ok(()) => None,
        };
        if let Err(e) = &result {
            if !matches!(e, CrawlError::Canceled) {
                self.emitter.emit_task_error(e);
            }
        }

        let summary = RunSummary {
            run_id: uuid::Uuid::new_v4().to_string(),
            provider: self.descriptor.name.clone(),
            query: query.to_string(),
            counters: counters.snapshot(),
            canceled,
            elapsed_ms: started.elapsed().as_millis() as u64,
            error,
        };
        self.emitter.emit_complete(summary.clone());
        summary
    }

    async fn drive(
        &self,
        session: &mut dyn BrowserSession,
        query: &str,
        pipeline: &DownloadPipeline,
        ctx: &PipelineContext,
        counters: &RunCounters,
    ) -> Result<(), CrawlError> {
        let descriptor = self.descriptor.as_ref();
        descriptor.validate()?;
        if descriptor.api_mode {
            return Err(CrawlError::Config {
                provider: descriptor.name.clone(),
                message: "API 模式提供方由外部客户端处理，引擎不执行抓取".to_string(),
            });
        }

        let mut extractor = Extractor::new(descriptor).map_err(|m| CrawlError::Config {
            provider: descriptor.name.clone(),
            message: m,
        })?;

        open_search_page(
            session,
            descriptor,
            query,
            &self.settings,
            &self.emitter,
            &self.cancel,
        )
        .await?;

        let mut scroll = ScrollEngine::new(
            descriptor.scrolling.clone(),
            descriptor.item_selector().map(str::to_string),
        );
        let deadline = self
            .options
            .time_budget_ms
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        let defer_resolution = needs_session(&descriptor.full_size);
        let mut deferred: Vec<CandidateItem> = Vec::new();

        loop {
            if self.cancel.is_canceled() {
                return Err(CrawlError::Canceled);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    self.emitter
                        .emit_task_log("info", "时间预算用尽，停止发现新候选");
                    break;
                }
            }

            let more = scroll
                .step(session)
                .await
                .map_err(|e| CrawlError::Navigation {
                    provider: descriptor.name.clone(),
                    url: query.to_string(),
                    message: e.to_string(),
                })?;
            if !more {
                break;
            }

            let html = session.page_html().await.map_err(|e| CrawlError::Navigation {
                provider: descriptor.name.clone(),
                url: query.to_string(),
                message: e.to_string(),
            })?;
            let page_url = session
                .current_url()
                .await
                .map_err(|e| CrawlError::Navigation {
                    provider: descriptor.name.clone(),
                    url: query.to_string(),
                    message: e.to_string(),
                })?;

            let new_items = extractor.extract(&html, &page_url, &self.emitter);
            if !new_items.is_empty() {
                counters.add_found(new_items.len() as u32);
                self.emitter
                    .emit_progress(&descriptor.name, counters.snapshot());
            }

            for candidate in new_items {
                if defer_resolution {
                    deferred.push(candidate);
                } else {
                    self.resolve_inline(pipeline, candidate).await;
                }
            }

            // 发现量达到上限后停止滚动；名额由管线侧严格执行
            if extractor.seen_count() as u32 >= self.options.max_results {
                self.emitter
                    .emit_task_log("info", "候选数量已达上限，停止滚动");
                break;
            }
        }

        // 导航类解析：滚动结束后独占会话串行执行
        for candidate in deferred {
            if self.cancel.is_canceled() {
                return Err(CrawlError::Canceled);
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break;
                }
            }
            if ctx.persisted_count() >= self.options.max_results {
                break;
            }
            match resolve_with_session(session, descriptor, &candidate).await {
                Ok(url) => {
                    self.submit(pipeline, candidate, url).await;
                }
                Err(e) => {
                    counters.add_failed();
                    self.emitter.emit_task_error(&e);
                    self.emitter
                        .emit_progress(&descriptor.name, counters.snapshot());
                }
            }
        }

        Ok(())
    }

    async fn resolve_inline(&self, pipeline: &DownloadPipeline, candidate: CandidateItem) {
        match resolve_url_only(&self.descriptor.full_size, &self.descriptor.name, &candidate) {
            Ok(url) => {
                self.submit(pipeline, candidate, url).await;
            }
            Err(e) => {
                self.emitter.emit_task_error(&e);
            }
        }
    }

    async fn submit(&self, pipeline: &DownloadPipeline, candidate: CandidateItem, url: String) {
        let mut image = ResolvedImage::pending(candidate);
        image.full_size_url = Some(url);
        image.advance(ImageStatus::Resolved);
        pipeline.submit(image).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::WaitUntil;
    use crate::crawler::downloader::FetchedBytes;
    use crate::emitter::CrawlEvent;
    use crate::error::BrowserError;
    use crate::provider::ProviderRegistry;
    use async_trait::async_trait;
    use serde_json::json;
    use std::io::Cursor;
    use std::path::{Path, PathBuf};
    use url::Url;

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        use image::{ImageOutputFormat, RgbImage};
        let img = RgbImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        out.into_inner()
    }

    /// 固定 HTML 的会话：导航后页面内容不变。
    struct FixedPageSession {
        html: String,
        current: Option<Url>,
    }

    #[async_trait]
    impl BrowserSession for FixedPageSession {
        async fn navigate(
            &mut self,
            url: &Url,
            _wait: WaitUntil,
            _timeout: std::time::Duration,
        ) -> Result<(), BrowserError> {
            self.current = Some(url.clone());
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
            Ok(())
        }

        async fn click(
            &mut self,
            _selector: &str,
            _timeout: std::time::Duration,
        ) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn wait_visible(
            &mut self,
            _selector: &str,
            _timeout: std::time::Duration,
        ) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn read_attribute(
            &mut self,
            _selector: &str,
            _attr: &str,
            _timeout: std::time::Duration,
        ) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }
    }

    struct AllPngFetcher;

    #[async_trait]
    impl Fetcher for AllPngFetcher {
        async fn fetch(&self, url: &str, _cancel: &CancelFlag) -> Result<FetchedBytes, String> {
            Ok(FetchedBytes {
                bytes: png_bytes(8, 8),
                final_url: url.to_string(),
                content_type: Some("image/png".to_string()),
            })
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

    fn descriptor() -> Arc<ProviderDescriptor> {
        let mut reg = ProviderRegistry::new();
        reg.load_value(json!({
            "name": "fixture",
            "searchUrlTemplate": "https://site.example/s?q={query}",
            "scrolling": { "type": "none" },
            "extraction": {
                "type": "attribute",
                "selector": "img.thumb",
                "attributes": ["src"]
            },
            "fullSize": { "type": "direct" }
        }))
        .unwrap();
        reg.get("fixture").unwrap()
    }

    fn coordinator(
        desc: Arc<ProviderDescriptor>,
        options: CrawlOptions,
        sink: Arc<MemorySink>,
        cancel: CancelFlag,
    ) -> (Coordinator, tokio::sync::mpsc::UnboundedReceiver<CrawlEvent>) {
        let (emitter, rx) = RunEmitter::channel();
        let coord = Coordinator::new(
            desc,
            options,
            EngineSettings::default(),
            Arc::new(AllPngFetcher),
            Arc::new(DefaultInspector),
            sink,
            emitter,
            cancel,
        );
        (coord, rx)
    }

    #[tokio::test]
    async fn test_run_downloads_extracted_candidates() {
        let sink = Arc::new(MemorySink::default());
        let (coord, mut rx) = coordinator(
            descriptor(),
            CrawlOptions::new("/tmp/out"),
            Arc::clone(&sink),
            CancelFlag::new(),
        );
        let mut session = FixedPageSession {
            html: r#"
                <img class="thumb" src="https://cdn.example/a.png">
                <img class="thumb" src="https://cdn.example/b.png">
            "#
            .to_string(),
            current: None,
        };

        let summary = coord.run(&mut session, "red panda").await;
        assert_eq!(summary.counters.found, 2);
        assert_eq!(summary.counters.downloaded, 2);
        assert!(!summary.canceled);
        assert!(summary.error.is_none());
        assert_eq!(sink.files.lock().unwrap().len(), 2);

        // complete 事件恰好一次，且是最后一个事件
        let mut completes = 0;
        let mut last_is_complete = false;
        while let Ok(ev) = rx.try_recv() {
            last_is_complete = matches!(ev, CrawlEvent::Complete { .. });
            if last_is_complete {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
        assert!(last_is_complete);
    }

    #[tokio::test]
    async fn test_max_results_limits_downloads() {
        let sink = Arc::new(MemorySink::default());
        let mut options = CrawlOptions::new("/tmp/out");
        options.max_results = 1;
        let (coord, _rx) = coordinator(descriptor(), options, Arc::clone(&sink), CancelFlag::new());
        let mut session = FixedPageSession {
            html: r#"
                <img class="thumb" src="https://cdn.example/a.png">
                <img class="thumb" src="https://cdn.example/b.png">
                <img class="thumb" src="https://cdn.example/c.png">
            "#
            .to_string(),
            current: None,
        };

        let summary = coord.run(&mut session, "q").await;
        assert_eq!(summary.counters.downloaded, 1);
        assert_eq!(sink.files.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_before_run_yields_canceled_summary() {
        let sink = Arc::new(MemorySink::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let (coord, _rx) = coordinator(
            descriptor(),
            CrawlOptions::new("/tmp/out"),
            Arc::clone(&sink),
            cancel,
        );
        let mut session = FixedPageSession {
            html: r#"<img class="thumb" src="https://cdn.example/a.png">"#.to_string(),
            current: None,
        };

        let summary = coord.run(&mut session, "q").await;
        assert!(summary.canceled);
        assert_eq!(summary.counters.downloaded, 0);
        assert!(sink.files.lock().unwrap().is_empty());
    }

    /// 第一次滚动时翻转取消信号的会话。
    struct CancelMidScrollSession {
        cancel: CancelFlag,
        current: Option<Url>,
        navigations: u32,
        scrolls: u32,
    }

    #[async_trait]
    impl BrowserSession for CancelMidScrollSession {
        async fn navigate(
            &mut self,
            url: &Url,
            _wait: WaitUntil,
            _timeout: std::time::Duration,
        ) -> Result<(), BrowserError> {
            self.navigations += 1;
            self.current = Some(url.clone());
            Ok(())
        }

        async fn current_url(&mut self) -> Result<Url, BrowserError> {
            self.current
                .clone()
                .ok_or_else(|| BrowserError("No page loaded".to_string()))
        }

        async fn page_html(&mut self) -> Result<String, BrowserError> {
            Ok("<div></div>".to_string())
        }

        async fn scroll_to_bottom(&mut self) -> Result<(), BrowserError> {
            self.scrolls += 1;
            self.cancel.cancel();
            Ok(())
        }

        async fn click(
            &mut self,
            _selector: &str,
            _timeout: std::time::Duration,
        ) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn wait_visible(
            &mut self,
            _selector: &str,
            _timeout: std::time::Duration,
        ) -> Result<bool, BrowserError> {
            Ok(false)
        }

        async fn read_attribute(
            &mut self,
            _selector: &str,
            _attr: &str,
            _timeout: std::time::Duration,
        ) -> Result<Option<String>, BrowserError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_stops_session_ops_with_one_summary() {
        let mut reg = ProviderRegistry::new();
        reg.load_value(json!({
            "name": "fixture",
            "searchUrlTemplate": "https://site.example/s?q={query}",
            "scrolling": {
                "type": "infinite_scroll",
                "maxScrolls": 5,
                "scrollDelayMs": 1,
                "noNewImagesRetries": 3
            },
            "extraction": {
                "type": "attribute",
                "selector": "img.thumb",
                "attributes": ["src"]
            }
        }))
        .unwrap();
        let desc = reg.get("fixture").unwrap();

        let sink = Arc::new(MemorySink::default());
        let cancel = CancelFlag::new();
        let (coord, mut rx) = coordinator(
            desc,
            CrawlOptions::new("/tmp/out"),
            Arc::clone(&sink),
            cancel.clone(),
        );
        let mut session = CancelMidScrollSession {
            cancel,
            current: None,
            navigations: 0,
            scrolls: 0,
        };

        let summary = coord.run(&mut session, "q").await;

        // 取消在下一个挂起点（循环开头）生效：第一次滚动后不再有任何会话操作
        assert!(summary.canceled);
        assert_eq!(session.scrolls, 1);
        assert_eq!(session.navigations, 1);
        assert_eq!(summary.counters.downloaded, 0);
        assert!(sink.files.lock().unwrap().is_empty());

        let mut completes = 0;
        let mut last_is_complete = false;
        while let Ok(ev) = rx.try_recv() {
            last_is_complete = matches!(ev, CrawlEvent::Complete { .. });
            if last_is_complete {
                completes += 1;
            }
        }
        assert_eq!(completes, 1);
        assert!(last_is_complete);
    }

    #[tokio::test]
    async fn test_api_mode_descriptor_is_rejected() {
        let mut reg = ProviderRegistry::new();
        reg.load_value(json!({
            "name": "api-only",
            "apiMode": true,
            "requiresApiKey": false
        }))
        .unwrap();
        let desc = reg.get("api-only").unwrap();

        let sink = Arc::new(MemorySink::default());
        let (coord, _rx) = coordinator(
            desc,
            CrawlOptions::new("/tmp/out"),
            Arc::clone(&sink),
            CancelFlag::new(),
        );
        let mut session = FixedPageSession {
            html: String::new(),
            current: None,
        };

        let summary = coord.run(&mut session, "q").await;
        assert!(summary.error.is_some());
        assert_eq!(summary.counters.downloaded, 0);
    }
}
