//! 交易提交的重试与加价策略
//!
//! 重试状态是显式的值（第几次尝试、当前费用、是否已加价、下次尝试时间），
//! 等待由调用方完成，因此可以被关闭信号打断。

use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::{
    chain_adapter::{Fee, SubmitError},
    config::{ChainConfig, RelayerConfig},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub gas_bump_percent: u32,
    pub gas_limit: u64,
    pub gas_price: u128,
    pub max_gas_price: u128,
}

impl RetryPolicy {
    pub fn new(relayer: &RelayerConfig, chain: &ChainConfig) -> Self {
        Self {
            max_retries: relayer.max_retries,
            initial_backoff: relayer.initial_backoff(),
            max_backoff: relayer.max_backoff(),
            gas_bump_percent: relayer.gas_bump_percent,
            gas_limit: chain.gas_limit,
            gas_price: chain.gas_price,
            max_gas_price: chain.max_gas_price,
        }
    }

    pub fn initial_fee(&self) -> Fee {
        Fee {
            gas_limit: self.gas_limit,
            gas_price: self.gas_price,
        }
    }

    /// 第 `attempt` 次失败后的等待时间（从 1 开始计），指数增长并封顶
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff.saturating_mul(factor).min(self.max_backoff)
    }

    /// 按百分比加价，结果限制在 `[gas_price, max_gas_price]`
    pub fn bumped_fee(&self, fee: Fee) -> Fee {
        let bump = fee.gas_price.saturating_mul(self.gas_bump_percent as u128) / 100;
        // 价格为 0 时百分比加价没有效果，至少加 1
        let raised = fee.gas_price.saturating_add(bump.max(1));
        Fee {
            gas_limit: fee.gas_limit,
            gas_price: raised.clamp(self.gas_price, self.max_gas_price.max(self.gas_price)),
        }
    }
}

/// 一次失败之后的决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// 等待 `after` 后用当前费用再次提交
    Retry { after: Duration },
    /// 调用已经被节点接受过，视为成功
    AlreadyDone,
    GiveUp(SubmitError),
}

#[derive(Debug, Clone)]
pub struct RetryState {
    attempt: u32,
    // 只统计瞬时失败，加价重发不占用重试次数
    transient_failures: u32,
    fee: Fee,
    bumped: bool,
    next_attempt_at: Option<Instant>,
}

impl RetryState {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            attempt: 0,
            transient_failures: 0,
            fee: policy.initial_fee(),
            bumped: false,
            next_attempt_at: None,
        }
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn transient_failures(&self) -> u32 {
        self.transient_failures
    }

    pub fn fee(&self) -> Fee {
        self.fee
    }

    pub fn bumped(&self) -> bool {
        self.bumped
    }

    /// 下一次尝试的时间点，调用方据此等待
    pub fn next_attempt_at(&self) -> Option<Instant> {
        self.next_attempt_at
    }

    /// 记录一次瞬时失败。返回退避时间；次数用尽时返回 None。
    ///
    /// 链上读取失败也走这里，与提交共用同一套退避参数。
    pub fn on_transient(&mut self, policy: &RetryPolicy) -> Option<Duration> {
        self.attempt += 1;
        self.transient_failures += 1;
        let after = if self.transient_failures > policy.max_retries {
            None
        } else {
            Some(policy.backoff_for_attempt(self.transient_failures))
        };
        self.next_attempt_at = after.map(|after| Instant::now() + after);
        after
    }

    pub fn on_failure(&mut self, policy: &RetryPolicy, error: SubmitError) -> RetryAction {
        let action = match error {
            e @ (SubmitError::Transient(_) | SubmitError::Timeout(_)) => {
                return match self.on_transient(policy) {
                    Some(after) => {
                        debug!(attempt = self.attempt, ?after, error = %e, "Transient submit failure, backing off");
                        RetryAction::Retry { after }
                    }
                    None => {
                        warn!(
                            attempt = self.attempt,
                            max = policy.max_retries,
                            error = %e,
                            "Retries exhausted"
                        );
                        RetryAction::GiveUp(e)
                    }
                };
            }
            SubmitError::AlreadyKnown(_) => RetryAction::AlreadyDone,
            SubmitError::Underpriced(_) if !self.bumped => {
                let previous = self.fee.gas_price;
                self.fee = policy.bumped_fee(self.fee);
                self.bumped = true;
                debug!(
                    previous,
                    bumped = self.fee.gas_price,
                    "Transaction underpriced, resubmitting with higher fee"
                );
                RetryAction::Retry { after: Duration::ZERO }
            }
            // 已经加过一次价仍然被拒绝，交给上层处理
            SubmitError::Underpriced(reason) => RetryAction::GiveUp(SubmitError::Underpriced(reason)),
            e @ SubmitError::Rejected(_) => RetryAction::GiveUp(e),
        };

        self.attempt += 1;
        self.next_attempt_at = match &action {
            RetryAction::Retry { after } => Some(Instant::now() + *after),
            _ => None,
        };
        action
    }
}
