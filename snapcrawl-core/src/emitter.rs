//! 每次运行独立的事件通道：进度 / 下载状态 / 日志 / 错误 / 完成。
//! 调用方持有接收端，引擎内部只通过 [RunEmitter] 发送，发送失败静默丢弃
//! （接收端被放弃不影响运行本身）。

use crate::crawler::{CounterSnapshot, RunSummary};
use crate::error::CrawlError;
use serde::Serialize;
use tokio::sync::mpsc;

/// 下载条目的状态流转（preparing → downloading → completed/skipped/failed/canceled）。
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStateEvent {
    pub url: String,
    pub state: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CrawlEvent {
    Progress {
        provider: String,
        counters: CounterSnapshot,
    },
    DownloadState(DownloadStateEvent),
    TaskLog {
        level: String,
        message: String,
    },
    TaskError {
        provider: String,
        stage: String,
        url: Option<String>,
        message: String,
    },
    /// 每次运行恰好发出一次。
    Complete {
        summary: RunSummary,
    },
}

#[derive(Debug, Clone)]
pub struct RunEmitter {
    tx: mpsc::UnboundedSender<CrawlEvent>,
}

impl RunEmitter {
    pub fn channel() -> (RunEmitter, mpsc::UnboundedReceiver<CrawlEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RunEmitter { tx }, rx)
    }

    pub fn emit(&self, event: CrawlEvent) {
        let _ = self.tx.send(event);
    }

    pub fn emit_progress(&self, provider: &str, counters: CounterSnapshot) {
        self.emit(CrawlEvent::Progress {
            provider: provider.to_string(),
            counters,
        });
    }

    pub fn emit_download_state(&self, url: &str, state: &str, error: Option<&str>) {
        self.emit(CrawlEvent::DownloadState(DownloadStateEvent {
            url: url.to_string(),
            state: state.to_string(),
            error: error.map(|e| e.to_string()),
        }));
    }

    pub fn emit_task_log(&self, level: &str, message: impl Into<String>) {
        self.emit(CrawlEvent::TaskLog {
            level: level.to_string(),
            message: message.into(),
        });
    }

    pub fn emit_task_error(&self, err: &CrawlError) {
        self.emit(CrawlEvent::TaskError {
            provider: err.provider().unwrap_or("").to_string(),
            stage: err.stage().as_str().to_string(),
            url: err.url().map(|u| u.to_string()),
            message: err.to_string(),
        });
    }

    pub fn emit_complete(&self, summary: RunSummary) {
        self.emit(CrawlEvent::Complete { summary });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let (emitter, mut rx) = RunEmitter::channel();
        emitter.emit_task_log("info", "start");
        emitter.emit_download_state("https://a/b.jpg", "downloading", None);
        drop(emitter);

        match rx.recv().await {
            Some(CrawlEvent::TaskLog { level, message }) => {
                assert_eq!(level, "info");
                assert_eq!(message, "start");
            }
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await {
            Some(CrawlEvent::DownloadState(ev)) => assert_eq!(ev.state, "downloading"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.recv().await.is_none());
    }
}
