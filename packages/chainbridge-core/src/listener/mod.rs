//! 源链事件监听：把链上原生事件翻译成规范消息并交给路由。
//!
//! 事件名到处理函数的映射在启动时显式构造（[`HandlerRegistry`]），
//! 新的事件类型只需注册新的处理函数，不必修改监听器本身。

use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

use crate::{
    chain_adapter::{ChainConnector, EventFilter, RawEvent},
    config::ChainKind,
    router::Router,
    types::{BlockNumber, ChainId},
    Error, Message,
};

pub mod evm;
pub mod substrate;

/// 处理函数的上下文，`chain` 是发出事件的链
#[derive(Debug, Clone, Copy)]
pub struct HandlerContext {
    pub chain: ChainId,
}

pub type EventHandler = Arc<dyn Fn(&RawEvent, &HandlerContext) -> Result<Message, Error> + Send + Sync>;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, EventHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 各链类型的默认事件集合
    pub fn for_kind(kind: ChainKind) -> Self {
        match kind {
            ChainKind::Evm => evm::handlers(),
            ChainKind::Substrate => substrate::handlers(),
        }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&RawEvent, &HandlerContext) -> Result<Message, Error> + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
        self
    }

    pub fn with<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&RawEvent, &HandlerContext) -> Result<Message, Error> + Send + Sync + 'static,
    {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<&EventHandler> {
        self.handlers.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// 把事件 `data` 解码成处理函数期望的原生结构
pub(crate) fn decode<T: serde::de::DeserializeOwned>(event: &RawEvent) -> Result<T, Error> {
    serde_json::from_value(event.data.clone()).map_err(|e| Error::EventDecode {
        event: event.name.clone(),
        reason: e.to_string(),
    })
}

pub(crate) fn parse_amount(event: &RawEvent, amount: &str) -> Result<u128, Error> {
    amount.parse().map_err(|e| Error::EventDecode {
        event: event.name.clone(),
        reason: format!("invalid amount {:?}: {}", amount, e),
    })
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl ForwardPolicy {
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }
}

pub struct EventListener {
    chain: ChainId,
    connector: Arc<dyn ChainConnector>,
    handlers: HandlerRegistry,
    router: Arc<Router>,
    filter: EventFilter,
    policy: ForwardPolicy,
    shutdown: watch::Receiver<bool>,
}

impl EventListener {
    pub fn new(
        connector: Arc<dyn ChainConnector>,
        handlers: HandlerRegistry,
        router: Arc<Router>,
        filter: EventFilter,
        policy: ForwardPolicy,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain: connector.chain_id(),
            connector,
            handlers,
            router,
            filter,
            policy,
            shutdown,
        }
    }

    pub fn chain(&self) -> ChainId {
        self.chain
    }

    /// 消费订阅直到关闭信号。订阅结束或转发彻底失败都是致命错误：
    /// 丢掉一笔已观察到的充值等同于丢失资金。
    pub async fn run(mut self) -> Result<(), Error> {
        let mut stream = self.connector.subscribe(self.filter.clone()).await?;
        info!(chain = self.chain, from_block = self.filter.from_block, "Listener started");
        let mut last_block: Option<BlockNumber> = None;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    info!(chain = self.chain, "Shutdown signal received, stopping listener");
                    return Ok(());
                }
                next = stream.next() => next,
            };

            let event = match next {
                Some(event) => event,
                None => {
                    error!(chain = self.chain, "Event subscription ended");
                    return Err(Error::Chain(format!("event subscription for chain {} ended", self.chain)));
                }
            };

            if let Some(prev) = last_block {
                if event.block_number < prev {
                    warn!(
                        chain = self.chain,
                        prev,
                        block = event.block_number,
                        event = %event.name,
                        "Event delivered out of block order"
                    );
                }
            }
            last_block = Some(event.block_number);

            match self.handle_event(&event).await {
                Ok(()) => {}
                Err(Error::Shutdown) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// 未注册的事件返回 `None`，保证未来新增的事件类型不会让监听器崩溃
    pub fn translate(&self, event: &RawEvent) -> Result<Option<Message>, Error> {
        let handler = match self.handlers.get(&event.name) {
            Some(handler) => handler,
            None => return Ok(None),
        };
        let ctx = HandlerContext { chain: self.chain };
        handler(event, &ctx).map(Some)
    }

    /// 单个事件的处理。只有转发失败会返回错误，解码失败记录后跳过。
    pub async fn handle_event(&self, event: &RawEvent) -> Result<(), Error> {
        match self.translate(event) {
            Ok(None) => {
                trace!(chain = self.chain, event = %event.name, "Ignoring unregistered event");
                Ok(())
            }
            Ok(Some(message)) => {
                debug!(
                    chain = self.chain,
                    block = event.block_number,
                    kind = %message.message_type(),
                    destination = message.destination(),
                    nonce = message.deposit_nonce(),
                    "Translated event"
                );
                self.forward(message).await
            }
            Err(e) => {
                warn!(
                    chain = self.chain,
                    block = event.block_number,
                    event = %event.name,
                    error = %e,
                    "Skipping event that could not be translated"
                );
                Ok(())
            }
        }
    }

    async fn forward(&self, message: Message) -> Result<(), Error> {
        let mut attempt = 0u32;
        loop {
            match self.router.route(message.clone()).await {
                Ok(()) => return Ok(()),
                // 配置错误：路由已经记录，消息被丢弃
                Err(Error::UnknownDestination(_)) => return Ok(()),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.policy.retries {
                        error!(
                            chain = self.chain,
                            nonce = message.deposit_nonce(),
                            attempts = attempt,
                            error = %e,
                            "Giving up forwarding message, halting listener"
                        );
                        return Err(Error::ForwardFailed {
                            chain: self.chain,
                            attempts: attempt,
                            reason: e.to_string(),
                        });
                    }
                    let backoff = self.policy.backoff_for_attempt(attempt);
                    warn!(
                        chain = self.chain,
                        attempt,
                        max = self.policy.retries,
                        ?backoff,
                        error = %e,
                        "Retrying message forward"
                    );
                    let mut shutdown = self.shutdown.clone();
                    tokio::select! {
                        _ = sleep(backoff) => {}
                        _ = shutdown.changed() => return Err(Error::Shutdown),
                    }
                }
            }
        }
    }
}
