//! 可复用的阶段重试策略：指数退避
//!
//! 最多尝试 max_retries + 1 次；失败后睡 base_delay * 2^attempt 再试，
//! 最后一次失败不再等待，直接以 StageExhausted 上抛。任何阶段都可复用，不各自手写睡眠循环。

use std::future::Future;
use std::time::Duration;

use crate::core::error::AgentError;

/// 重试策略：尝试次数上限与退避基准时长
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 首次之外允许的重试次数（总尝试数 = max_retries + 1）
    pub max_retries: usize,
    /// 退避基准：第 n 次失败后等待 base_delay * 2^n
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// 执行 f 直到成功或尝试耗尽
    pub async fn run<T, F, Fut>(&self, stage: &str, mut f: F) -> Result<T, AgentError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AgentError>>,
    {
        let attempts = self.max_retries + 1;
        let mut last_error: Option<AgentError> = None;

        for attempt in 0..attempts {
            tracing::debug!("{} attempt {}/{}", stage, attempt + 1, attempts);
            match f().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::info!("{} succeeded on attempt {}", stage, attempt + 1);
                    }
                    return Ok(value);
                }
                Err(e) => {
                    tracing::warn!("{} failed on attempt {}: {}", stage, attempt + 1, e);
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        let delay = self.base_delay * 2u32.saturating_pow(attempt as u32);
                        if !delay.is_zero() {
                            tracing::debug!("retrying {} in {:?}", stage, delay);
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        // last_error 在至少一次失败后必然存在
        let last = last_error.unwrap_or_else(|| {
            AgentError::Precondition(format!("{stage}: no attempt executed"))
        });
        Err(AgentError::StageExhausted {
            stage: stage.to_string(),
            attempts,
            last: Box::new(last),
        })
    }
}
