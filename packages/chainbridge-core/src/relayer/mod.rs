use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::{
    chain_adapter::{ChainHandle, ConnectorFactory, EventFilter},
    config::{ChainConfig, Config},
    listener::{EventListener, ForwardPolicy, HandlerRegistry},
    proposal::ProposalStore,
    router::Router,
    types::ChainId,
    writer::Writer,
    Error, Message,
};

struct WriterSlot {
    writer: Arc<Writer>,
    inbox: mpsc::Receiver<Message>,
    snapshot: Option<PathBuf>,
}

/// 把每条链的监听器、写入器和路由连接起来的整个中继进程
pub struct Relayer {
    config: Config,
    listeners: Vec<EventListener>,
    writers: Vec<WriterSlot>,
    shutdown: watch::Sender<bool>,
}

impl Relayer {
    pub async fn new(config: Config, factory: &dyn ConnectorFactory) -> Result<Self, Error> {
        config.validate()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut router = Router::new(config.relayer.route_timeout());
        let mut connected: Vec<(&ChainConfig, ChainHandle)> = Vec::with_capacity(config.chains.len());
        let mut writers = Vec::with_capacity(config.chains.len());

        for chain in &config.chains {
            let handle = factory.connect(chain).await?;
            if handle.connector.chain_id() != chain.id {
                return Err(Error::Config(format!(
                    "Connector for chain {} reports chain id {}",
                    chain.id,
                    handle.connector.chain_id()
                )));
            }

            let store = match &chain.proposal_store {
                Some(path) => {
                    ProposalStore::load(path, chain.id, chain.threshold, chain.proposal_expiry).await?
                }
                None => ProposalStore::new(chain.id, chain.threshold, chain.proposal_expiry),
            };
            let writer = Writer::new(chain, &config.relayer, handle.clone(), Arc::new(store), shutdown_rx.clone())?;
            let (inbox_tx, inbox) = mpsc::channel(config.relayer.writer_queue_size);
            router.register(chain.id, inbox_tx);
            writers.push(WriterSlot {
                writer: Arc::new(writer),
                inbox,
                snapshot: chain.proposal_store.clone(),
            });
            info!(chain = chain.id, name = %chain.name, kind = %chain.kind, "Connected to chain");
            connected.push((chain, handle));
        }

        let router = Arc::new(router);
        let policy = ForwardPolicy {
            retries: config.relayer.forward_retries,
            backoff: config.relayer.forward_backoff(),
        };
        let listeners = connected
            .into_iter()
            .map(|(chain, handle)| {
                let handlers = HandlerRegistry::for_kind(chain.kind);
                let filter = EventFilter {
                    bridge_address: chain.bridge_address.clone(),
                    from_block: chain.start_block,
                    confirmations: chain.block_confirmations,
                    event_names: handlers.names(),
                };
                EventListener::new(handle.connector, handlers, router.clone(), filter, policy, shutdown_rx.clone())
            })
            .collect();

        Ok(Self {
            config,
            listeners,
            writers,
            shutdown,
        })
    }

    pub fn chains(&self) -> Vec<ChainId> {
        self.config.chains.iter().map(|c| c.id).collect()
    }

    pub fn store(&self, chain: ChainId) -> Option<Arc<ProposalStore>> {
        self.writers
            .iter()
            .find(|slot| slot.writer.chain() == chain)
            .map(|slot| slot.writer.store().clone())
    }

    /// 运行直到 `signal` 完成或某个组件出现致命错误。
    ///
    /// 两种情况都会广播关闭：监听器停止消费，写入器停止读取收件箱并处理完在途消息，
    /// 最后保存提案快照。
    pub async fn run<F>(self, signal: F) -> Result<(), Error>
    where
        F: Future<Output = ()>,
    {
        let Relayer {
            config,
            listeners,
            writers,
            shutdown,
        } = self;
        info!(chains = config.chains.len(), "Starting relayer");

        let mut tasks: JoinSet<(String, Result<(), Error>)> = JoinSet::new();
        let mut snapshots = Vec::new();
        for listener in listeners {
            let name = format!("listener for chain {}", listener.chain());
            tasks.spawn(async move { (name, listener.run().await) });
        }
        for slot in writers {
            let name = format!("writer for chain {}", slot.writer.chain());
            let max_in_flight = config.relayer.max_in_flight;
            if let Some(path) = slot.snapshot {
                snapshots.push((slot.writer.store().clone(), path));
            }
            let writer = slot.writer;
            let inbox = slot.inbox;
            tasks.spawn(async move { (name, writer.run(inbox, max_in_flight).await) });
        }

        tokio::pin!(signal);
        let mut signalled = false;
        let mut failure: Option<Error> = None;
        loop {
            tokio::select! {
                _ = &mut signal, if !signalled => {
                    info!("Shutdown requested, draining");
                    signalled = true;
                    shutdown.send_replace(true);
                }
                joined = tasks.join_next() => {
                    let (name, result) = match joined {
                        None => break,
                        Some(Ok(done)) => done,
                        Some(Err(e)) => ("relayer task".to_string(), Err(Error::Chain(format!("task panicked: {}", e)))),
                    };
                    match result {
                        Ok(()) => info!(task = %name, "Task stopped"),
                        Err(e) => {
                            error!(task = %name, error = %e, "Fatal error, shutting down relayer");
                            shutdown.send_replace(true);
                            if failure.is_none() {
                                failure = Some(e);
                            }
                        }
                    }
                }
            }
        }

        for (store, path) in snapshots {
            if let Err(e) = store.save(&path).await {
                warn!(chain = store.chain(), error = %e, "Failed to save proposal snapshot");
            }
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!("Relayer stopped");
                Ok(())
            }
        }
    }
}
