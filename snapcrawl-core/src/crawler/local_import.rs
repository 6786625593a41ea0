//! 本地目录导入：递归扫描图片文件，走与网络下载同一条管线
//! （同样的解码校验、尺寸/格式过滤、安全命名与计数）。

use crate::crawler::downloader::{DownloadPipeline, FileFetcher, PipelineContext};
use crate::crawler::{
    CancelFlag, CandidateItem, CrawlOptions, ImageStatus, ResolvedImage, RunCounters, RunSummary,
};
use crate::emitter::RunEmitter;
use crate::image_type::is_image_by_path;
use crate::storage::FsImageSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::time::Instant;

const LOCAL_PROVIDER: &str = "local";

/// 递归收集目录下的图片文件。单个子目录读取失败记日志后继续。
async fn collect_image_files(
    root: &Path,
    emitter: &RunEmitter,
    cancel: &CancelFlag,
) -> Vec<PathBuf> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if cancel.is_canceled() {
            break;
        }
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) => {
                emitter.emit_task_log(
                    "warn",
                    format!("无法读取目录 {}: {}", dir.display(), e),
                );
                continue;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if is_image_by_path(&path) {
                out.push(path);
            }
        }
    }
    // 扫描顺序与文件系统相关，排序保证结果可复现
    out.sort();
    out
}

/// 导入一个本地目录。返回与网络运行同构的摘要，complete 事件同样恰好一次。
pub async fn import_local_dir(
    source: &Path,
    options: CrawlOptions,
    emitter: RunEmitter,
    cancel: CancelFlag,
) -> RunSummary {
    let started = Instant::now();
    let counters = Arc::new(RunCounters::default());

    let files = collect_image_files(source, &emitter, &cancel).await;
    counters.add_found(files.len() as u32);
    emitter.emit_progress(LOCAL_PROVIDER, counters.snapshot());

    let ctx = Arc::new(PipelineContext::new(
        LOCAL_PROVIDER,
        options,
        Arc::new(FileFetcher),
        Arc::new(crate::image_type::DefaultInspector),
        Arc::new(FsImageSink),
        Arc::clone(&counters),
        emitter.clone(),
        cancel.clone(),
    ));
    let pipeline = DownloadPipeline::spawn(ctx);

    for (index, path) in files.iter().enumerate() {
        if cancel.is_canceled() {
            break;
        }
        let reference = path.to_string_lossy().to_string();
        let candidate = CandidateItem {
            id: reference.clone(),
            thumbnail_url: None,
            detail_url: None,
            title: path
                .file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string),
            index,
            provider: LOCAL_PROVIDER.to_string(),
        };
        let mut image = ResolvedImage::pending(candidate);
        image.full_size_url = Some(reference);
        image.advance(ImageStatus::Resolved);
        pipeline.submit(image).await;
    }
    pipeline.finish().await;

    let summary = RunSummary {
        run_id: uuid::Uuid::new_v4().to_string(),
        provider: LOCAL_PROVIDER.to_string(),
        query: source.display().to_string(),
        counters: counters.snapshot(),
        canceled: cancel.is_canceled(),
        elapsed_ms: started.elapsed().as_millis() as u64,
        error: None,
    };
    emitter.emit_complete(summary.clone());
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn write_png(path: &Path, width: u32, height: u32) {
        use image::{ImageOutputFormat, RgbImage};
        let img = RgbImage::new(width, height);
        let mut out = Cursor::new(Vec::new());
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut out, ImageOutputFormat::Png)
            .unwrap();
        std::fs::write(path, out.into_inner()).unwrap();
    }

    #[tokio::test]
    async fn test_import_recurses_and_filters_non_images() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_png(&src.path().join("a.png"), 8, 8);
        std::fs::write(src.path().join("notes.txt"), "not an image").unwrap();
        let nested = src.path().join("nested");
        std::fs::create_dir(&nested).unwrap();
        write_png(&nested.join("b.png"), 8, 8);

        let (emitter, _rx) = RunEmitter::channel();
        let summary = import_local_dir(
            src.path(),
            CrawlOptions::new(dst.path()),
            emitter,
            CancelFlag::new(),
        )
        .await;

        assert_eq!(summary.counters.found, 2);
        assert_eq!(summary.counters.downloaded, 2);
        let written: Vec<_> = std::fs::read_dir(dst.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(written.len(), 2);
    }

    #[tokio::test]
    async fn test_import_applies_dimension_gate() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        write_png(&src.path().join("small.png"), 4, 4);
        write_png(&src.path().join("big.png"), 64, 64);

        let mut options = CrawlOptions::new(dst.path());
        options.min_width = 32;
        options.min_height = 32;
        let (emitter, _rx) = RunEmitter::channel();
        let summary =
            import_local_dir(src.path(), options, emitter, CancelFlag::new()).await;

        assert_eq!(summary.counters.downloaded, 1);
        assert_eq!(summary.counters.skipped, 1);
    }
}
