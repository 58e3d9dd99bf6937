//! 弹性原语：指数退避重试 + 按依赖标识划分的熔断器
//!
//! ResiliencePolicy 在每个外部调用点显式使用：`policy.call("llm", || ...)`。
//! 熔断器状态机：Closed --连续失败达到阈值--> Open --恢复窗口结束--> HalfOpen
//! --试探调用全部成功--> Closed；HalfOpen 期间任一失败立即回到 Open。

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::core::{MissionError, RecoveryAction, RecoveryEngine, Result};

/// 重试策略：最多 max_attempts 次，延迟 base * 2^(n-1)，不超过 max_delay
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// 第 attempt 次失败后的等待时间（attempt 从 1 开始）
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

/// 熔断器参数
#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// 连续失败多少次后打开
    pub failure_threshold: u32,
    /// 打开后保持多久
    pub recovery_window: Duration,
    /// 半开状态允许的试探调用数
    pub half_open_max_calls: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_window: Duration::from_secs(30),
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// 可写入任务快照的熔断器计数（Instant 不可序列化，恢复时重新计时）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
}

/// 单个依赖的熔断器
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    half_open_issued: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            half_open_issued: 0,
            half_open_successes: 0,
        }
    }

    /// 从快照恢复；Open 与 HalfOpen 都以恢复时刻重新开始恢复窗口
    pub fn restore(config: BreakerConfig, snapshot: BreakerSnapshot) -> Self {
        let mut breaker = Self::new(config);
        breaker.consecutive_failures = snapshot.consecutive_failures;
        if snapshot.state != BreakerState::Closed {
            breaker.trip();
        }
        breaker
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        BreakerSnapshot {
            state: self.state,
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// 申请一次调用许可；返回 false 表示应以 CircuitOpen 直接失败
    pub fn try_acquire(&mut self) -> bool {
        if self.state == BreakerState::Open {
            let elapsed = self
                .opened_at
                .map(|t| t.elapsed())
                .unwrap_or(self.config.recovery_window);
            if elapsed < self.config.recovery_window {
                return false;
            }
            self.state = BreakerState::HalfOpen;
            self.half_open_issued = 0;
            self.half_open_successes = 0;
        }
        match self.state {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => {
                if self.half_open_issued < self.config.half_open_max_calls {
                    self.half_open_issued += 1;
                    true
                } else {
                    false
                }
            }
            BreakerState::Open => false,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            BreakerState::Closed => self.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.state = BreakerState::Closed;
                    self.consecutive_failures = 0;
                    self.opened_at = None;
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            BreakerState::Closed => {
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip();
                }
            }
            BreakerState::HalfOpen => self.trip(),
            BreakerState::Open => {}
        }
    }

    /// 调用以非依赖错误结束（如校验失败）：归还半开许可，不影响计数
    pub fn release(&mut self) {
        if self.state == BreakerState::HalfOpen {
            self.half_open_issued = self.half_open_issued.saturating_sub(1);
        }
    }

    fn trip(&mut self) {
        self.state = BreakerState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_issued = 0;
        self.half_open_successes = 0;
    }
}

/// 按依赖标识（如 "llm"、"tool:search"、"retrieval:vector"）管理熔断器
#[derive(Debug)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    fn with_breaker<R>(&self, dependency: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = guard
            .entry(dependency.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.config));
        f(breaker)
    }

    pub fn acquire(&self, dependency: &str) -> Result<()> {
        if self.with_breaker(dependency, |b| b.try_acquire()) {
            Ok(())
        } else {
            Err(MissionError::CircuitOpen {
                dependency: dependency.to_string(),
            })
        }
    }

    pub fn record_success(&self, dependency: &str) {
        self.with_breaker(dependency, |b| b.record_success());
    }

    pub fn record_failure(&self, dependency: &str) {
        let opened = self.with_breaker(dependency, |b| {
            let before = b.state();
            b.record_failure();
            before != BreakerState::Open && b.state() == BreakerState::Open
        });
        if opened {
            tracing::warn!(dependency, "circuit breaker opened");
        }
    }

    pub fn release(&self, dependency: &str) {
        self.with_breaker(dependency, |b| b.release());
    }

    /// 重试耗尽：不论连续失败计数，直接打开熔断器
    pub fn trip(&self, dependency: &str) {
        let opened = self.with_breaker(dependency, |b| {
            let before = b.state();
            b.trip();
            before != BreakerState::Open
        });
        if opened {
            tracing::warn!(dependency, "circuit breaker opened after exhausted retries");
        }
    }

    pub fn state(&self, dependency: &str) -> BreakerState {
        self.with_breaker(dependency, |b| b.state())
    }

    /// 所有依赖的计数快照（BTreeMap 保证序列化顺序稳定）
    pub fn snapshot(&self) -> BTreeMap<String, BreakerSnapshot> {
        let guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .iter()
            .map(|(k, b)| (k.clone(), b.snapshot()))
            .collect()
    }

    pub fn restore(&self, snapshot: &BTreeMap<String, BreakerSnapshot>) {
        let mut guard = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        guard.clear();
        for (dependency, snap) in snapshot {
            guard.insert(dependency.clone(), CircuitBreaker::restore(self.config, *snap));
        }
    }
}

/// 显式弹性策略：重试 + 熔断，作用于每个外部依赖调用点
#[derive(Debug, Clone)]
pub struct ResiliencePolicy {
    retry: RetryPolicy,
    breakers: Arc<BreakerRegistry>,
    recovery: RecoveryEngine,
}

impl ResiliencePolicy {
    pub fn new(retry: RetryPolicy, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            retry,
            breakers,
            recovery: RecoveryEngine::new(),
        }
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// 以重试与熔断包裹一次依赖调用；仅瞬时错误会重试，熔断打开时不调用 op
    pub async fn call<T, F, Fut>(&self, dependency: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            self.breakers.acquire(dependency)?;
            let err = match op().await {
                Ok(value) => {
                    self.breakers.record_success(dependency);
                    return Ok(value);
                }
                Err(e) => e,
            };

            if err.counts_as_dependency_failure() {
                self.breakers.record_failure(dependency);
            } else {
                self.breakers.release(dependency);
            }

            if !matches!(self.recovery.handle(&err), RecoveryAction::Retry) {
                return Err(err);
            }
            if attempt >= self.retry.max_attempts {
                self.breakers.trip(dependency);
                return Err(MissionError::RetriesExhausted {
                    dependency: dependency.to_string(),
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let delay = self.retry.delay_for(attempt);
            tracing::warn!(
                dependency,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}
