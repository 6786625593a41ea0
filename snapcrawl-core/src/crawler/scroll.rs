//! 滚动/翻页引擎。状态机 idle → scrolling ⇄ waiting → done。
//!
//! 引擎以 step() 驱动：首次 step 代表"页面初始状态"这一轮（不做任何滚动），
//! 之后每次 step 按策略扩张一次可见结果集。协调器在每次 step 返回 true 后
//! 对当前快照做一轮提取；返回 false 表示结束。预算/取消检查由协调器放在
//! 每次 step 之前（即每轮迭代开头的挂起点）。

use crate::browser::BrowserSession;
use crate::error::BrowserError;
use crate::provider::ScrollStrategy;
use std::time::Duration;
use tokio::time::{sleep, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrollState {
    Idle,
    Scrolling,
    Done,
}

pub struct ScrollEngine {
    strategy: ScrollStrategy,
    /// 增长采样用的条目选择器
    item_selector: Option<String>,
    state: ScrollState,
    iterations: u32,
    last_count: usize,
    stagnant: u32,
}

impl ScrollEngine {
    pub fn new(strategy: ScrollStrategy, item_selector: Option<String>) -> Self {
        Self {
            strategy,
            item_selector,
            state: ScrollState::Idle,
            iterations: 0,
            last_count: 0,
            stagnant: 0,
        }
    }

    pub fn state(&self) -> ScrollState {
        self.state
    }

    async fn sample_count(
        &mut self,
        session: &mut dyn BrowserSession,
    ) -> Result<usize, BrowserError> {
        match &self.item_selector {
            Some(sel) => session.count_elements(sel).await,
            None => Ok(0),
        }
    }

    /// 推进一步。Ok(true)：本轮页面已就绪，可提取；Ok(false)：结束。
    pub async fn step(&mut self, session: &mut dyn BrowserSession) -> Result<bool, BrowserError> {
        match self.state {
            ScrollState::Done => return Ok(false),
            ScrollState::Idle => {
                // 初始轮：页面按导航后的状态直接提取
                self.state = ScrollState::Scrolling;
                self.last_count = self.sample_count(session).await.unwrap_or(0);
                return Ok(true);
            }
            ScrollState::Scrolling => {}
        }

        let more = match self.strategy.clone() {
            ScrollStrategy::None => false,
            ScrollStrategy::InfiniteScroll {
                max_scrolls,
                scroll_delay_ms,
                no_new_images_retries,
            } => {
                if self.iterations >= max_scrolls {
                    false
                } else {
                    self.iterations += 1;
                    session.scroll_to_bottom().await?;
                    sleep(Duration::from_millis(scroll_delay_ms)).await;
                    let count = self.sample_count(session).await?;
                    if count <= self.last_count {
                        self.stagnant += 1;
                    } else {
                        self.stagnant = 0;
                        self.last_count = count;
                    }
                    self.stagnant < no_new_images_retries
                }
            }
            ScrollStrategy::LoadMoreButtonOrScroll {
                button_selector,
                max_attempts,
                load_more_timeout_ms,
                scroll_delay_ms,
            } => {
                if self.iterations >= max_attempts {
                    false
                } else {
                    self.iterations += 1;
                    let clicked = session
                        .click(&button_selector, Duration::from_millis(1500))
                        .await?;
                    if clicked {
                        // 等待新内容出现，最多 load_more_timeout
                        let deadline = Instant::now() + Duration::from_millis(load_more_timeout_ms);
                        loop {
                            sleep(Duration::from_millis(200)).await;
                            let count = self.sample_count(session).await?;
                            if count > self.last_count || Instant::now() >= deadline {
                                break;
                            }
                        }
                    } else {
                        // 按钮不存在：退化为一次无限滚动步
                        session.scroll_to_bottom().await?;
                        sleep(Duration::from_millis(scroll_delay_ms)).await;
                    }
                    let count = self.sample_count(session).await?;
                    let grew = count > self.last_count;
                    if grew {
                        self.last_count = count;
                    }
                    // 按钮消失且结果不再增长时结束
                    clicked || grew
                }
            }
            ScrollStrategy::Manual {
                next_selector,
                max_scrolls,
            } => {
                // maxScrolls = 0：单轮，不点击
                if max_scrolls == 0 || self.iterations >= max_scrolls {
                    false
                } else {
                    self.iterations += 1;
                    let clicked = session
                        .click(&next_selector, Duration::from_millis(3000))
                        .await?;
                    if clicked {
                        sleep(Duration::from_millis(500)).await;
                    }
                    clicked
                }
            }
        };

        if !more {
            self.state = ScrollState::Done;
        }
        Ok(more)
    }
}
