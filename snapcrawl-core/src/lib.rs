//! Snapcrawl 引擎核心库：descriptor 驱动的图片抓取。
//!
//! 一次运行 = 校验 descriptor → 打开搜索页 → 滚动/提取循环 → 原图解析
//! → 并发下载与校验 → 摘要。调用方注入 [browser::BrowserSession]（页面驱动）、
//! 事件接收端（[emitter::RunEmitter]）与可选的取数/落盘协作方。

pub mod browser;
pub mod crawler;
pub mod emitter;
pub mod error;
pub mod image_type;
pub mod provider;
pub mod settings;
pub mod storage;

pub use crawler::coordinator::Coordinator;
pub use crawler::local_import::import_local_dir;
pub use crawler::{CancelFlag, CrawlOptions, RunSummary};
pub use emitter::{CrawlEvent, RunEmitter};
pub use error::CrawlError;
pub use provider::{ProviderDescriptor, ProviderRegistry};
