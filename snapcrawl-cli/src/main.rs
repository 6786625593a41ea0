//! Snapcrawl 命令行工具
//!
//! 目前支持：
//! - `crawl`：按 descriptor 抓取搜索结果图片（内置静态页面会话，无 JS 执行）
//! - `import`：递归导入本地目录中的图片（与抓取共用校验/过滤/命名逻辑）
//! - `validate`：只加载并校验 descriptor 文件，不发起任何网络请求

use clap::{Args, Parser, Subcommand};
use snapcrawl_core::browser::StaticSession;
use snapcrawl_core::emitter::CrawlEvent;
use snapcrawl_core::settings::EngineSettings;
use snapcrawl_core::{
    CancelFlag, Coordinator, CrawlOptions, ProviderRegistry, RunEmitter, RunSummary,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "snapcrawl")]
#[command(version)]
#[command(about = "Descriptor 驱动的图片抓取工具", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// 按 descriptor 抓取搜索结果图片
    Crawl(CrawlArgs),
    /// 递归导入本地目录中的图片
    Import(ImportArgs),
    /// 校验 descriptor 文件（不发起网络请求）
    Validate(ValidateArgs),
}

#[derive(Args, Debug)]
struct CrawlArgs {
    /// descriptor JSON 文件路径
    #[arg(short = 'd', long = "descriptor")]
    descriptor: PathBuf,

    /// 搜索关键词
    query: String,

    /// 输出目录
    #[arg(short = 'o', long = "output-dir")]
    output_dir: PathBuf,

    /// 最多保存的图片数
    #[arg(long = "max-results")]
    max_results: Option<u32>,

    /// 最小宽度（像素），不满足的图片跳过
    #[arg(long = "min-width")]
    min_width: Option<u32>,

    /// 最小高度（像素）
    #[arg(long = "min-height")]
    min_height: Option<u32>,

    /// 允许的图片类型（可重复，如 --type jpg --type png）；不指定则使用内置列表
    #[arg(long = "type")]
    types: Vec<String>,

    /// 下载并发度
    #[arg(long = "concurrency")]
    concurrency: Option<u32>,

    /// 整个运行的时间预算（毫秒）
    #[arg(long = "time-budget-ms")]
    time_budget_ms: Option<u64>,

    /// 打印每条事件的 JSON（默认只打印日志与摘要）
    #[arg(long = "json-events", default_value_t = false)]
    json_events: bool,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// 要扫描的本地目录
    source: PathBuf,

    /// 输出目录
    #[arg(short = 'o', long = "output-dir")]
    output_dir: PathBuf,

    /// 最小宽度（像素）
    #[arg(long = "min-width")]
    min_width: Option<u32>,

    /// 最小高度（像素）
    #[arg(long = "min-height")]
    min_height: Option<u32>,

    /// 允许的图片类型（可重复）
    #[arg(long = "type")]
    types: Vec<String>,
}

#[derive(Args, Debug)]
struct ValidateArgs {
    /// descriptor JSON 文件路径（可多个）
    files: Vec<PathBuf>,
}

fn build_options(
    output_dir: PathBuf,
    max_results: Option<u32>,
    min_width: Option<u32>,
    min_height: Option<u32>,
    types: Vec<String>,
    concurrency: Option<u32>,
    time_budget_ms: Option<u64>,
) -> CrawlOptions {
    let mut options = CrawlOptions::new(output_dir);
    if let Some(n) = max_results {
        options.max_results = n;
    }
    if let Some(w) = min_width {
        options.min_width = w;
    }
    if let Some(h) = min_height {
        options.min_height = h;
    }
    options.allowed_types = types;
    if let Some(c) = concurrency {
        options.concurrency = c;
    }
    options.time_budget_ms = time_budget_ms;
    options
}

/// 事件打印循环：日志到 stderr，其余按需打印 JSON。
async fn print_events(
    mut rx: tokio::sync::mpsc::UnboundedReceiver<CrawlEvent>,
    json_events: bool,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            CrawlEvent::TaskLog { level, message } => {
                eprintln!("[{}] {}", level, message);
            }
            CrawlEvent::TaskError { stage, message, .. } => {
                eprintln!("[error/{}] {}", stage, message);
            }
            CrawlEvent::Progress { counters, .. } => {
                if json_events {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                } else {
                    eprintln!(
                        "进度: 发现 {} / 已下载 {} / 跳过 {} / 失败 {}",
                        counters.found, counters.downloaded, counters.skipped, counters.failed
                    );
                }
            }
            _ => {
                if json_events {
                    if let Ok(line) = serde_json::to_string(&event) {
                        println!("{}", line);
                    }
                }
            }
        }
    }
}

fn print_summary(summary: &RunSummary) {
    match serde_json::to_string_pretty(summary) {
        Ok(text) => println!("{}", text),
        Err(_) => println!("{:?}", summary),
    }
}

fn watch_ctrl_c(cancel: CancelFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("收到 Ctrl-C，正在取消……");
            cancel.cancel();
        }
    });
}

async fn run_crawl(args: CrawlArgs) -> ExitCode {
    let mut registry = ProviderRegistry::new();
    if let Err(e) = registry.load_file(&args.descriptor) {
        eprintln!("{}", e);
        return ExitCode::FAILURE;
    }
    let names = registry.names();
    // 单文件单 descriptor
    let descriptor = match names.first().and_then(|n| registry.get(n)) {
        Some(d) => d,
        None => {
            eprintln!("descriptor 文件未包含任何提供方");
            return ExitCode::FAILURE;
        }
    };

    let settings = EngineSettings::default();
    let options = build_options(
        args.output_dir,
        args.max_results,
        args.min_width,
        args.min_height,
        args.types,
        args.concurrency,
        args.time_budget_ms,
    );

    let mut session = match StaticSession::new(&settings) {
        Ok(s) => s.with_headers(descriptor.http_headers.clone()),
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let (emitter, rx) = RunEmitter::channel();
    let cancel = CancelFlag::new();
    watch_ctrl_c(cancel.clone());
    let printer = tokio::spawn(print_events(rx, args.json_events));

    let coordinator = match Coordinator::with_defaults(
        Arc::clone(&descriptor),
        options,
        settings,
        emitter,
        cancel,
    ) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let summary = coordinator.run(&mut session, &args.query).await;
    let _ = printer.await;
    print_summary(&summary);

    if summary.error.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn run_import(args: ImportArgs) -> ExitCode {
    let options = build_options(
        args.output_dir,
        None,
        args.min_width,
        args.min_height,
        args.types,
        None,
        None,
    );
    let (emitter, rx) = RunEmitter::channel();
    let cancel = CancelFlag::new();
    watch_ctrl_c(cancel.clone());
    let printer = tokio::spawn(print_events(rx, false));

    let summary =
        snapcrawl_core::import_local_dir(&args.source, options, emitter, cancel).await;
    let _ = printer.await;
    print_summary(&summary);
    ExitCode::SUCCESS
}

fn run_validate(args: ValidateArgs) -> ExitCode {
    let mut failed = false;
    for path in &args.files {
        let mut registry = ProviderRegistry::new();
        match registry.load_file(path) {
            Ok(()) => {
                for name in registry.names() {
                    println!("{}: OK ({})", path.display(), name);
                }
            }
            Err(e) => {
                failed = true;
                eprintln!("{}: {}", path.display(), e);
            }
        }
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match cli.command {
        Commands::Crawl(args) => run_crawl(args).await,
        Commands::Import(args) => run_import(args).await,
        Commands::Validate(args) => run_validate(args),
    }
}
