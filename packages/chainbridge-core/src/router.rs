use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::{types::ChainId, Error, Message};

/// 纯分发：按消息的目标链找到对应写入器的收件箱。重试属于写入器，这一层不重试。
pub struct Router {
    writers: HashMap<ChainId, mpsc::Sender<Message>>,
    send_timeout: Duration,
}

impl Router {
    pub fn new(send_timeout: Duration) -> Self {
        Self {
            writers: HashMap::new(),
            send_timeout,
        }
    }

    pub fn register(&mut self, chain: ChainId, inbox: mpsc::Sender<Message>) {
        self.writers.insert(chain, inbox);
    }

    pub fn destinations(&self) -> Vec<ChainId> {
        let mut chains: Vec<_> = self.writers.keys().copied().collect();
        chains.sort_unstable();
        chains
    }

    pub async fn route(&self, message: Message) -> Result<(), Error> {
        let destination = message.destination();
        let inbox = match self.writers.get(&destination) {
            Some(inbox) => inbox,
            None => {
                error!(
                    destination,
                    source = message.source(),
                    nonce = message.deposit_nonce(),
                    kind = %message.message_type(),
                    "No writer for destination, dropping message"
                );
                return Err(Error::UnknownDestination(destination));
            }
        };

        debug!(
            destination,
            source = message.source(),
            nonce = message.deposit_nonce(),
            kind = %message.message_type(),
            "Routing message"
        );
        inbox
            .send_timeout(message, self.send_timeout)
            .await
            .map_err(|e| match e {
                mpsc::error::SendTimeoutError::Timeout(_) => {
                    Error::RouterUnavailable(format!("writer for chain {} is not accepting messages", destination))
                }
                mpsc::error::SendTimeoutError::Closed(_) => {
                    Error::RouterUnavailable(format!("writer for chain {} has stopped", destination))
                }
            })
    }
}
