//! Redis-backed store client
//!
//! Commands go through a [`ConnectionManager`], which transparently
//! reconnects after connection loss. The pub-sub subscription needs a
//! dedicated connection; its loop re-dials and re-subscribes with a fixed
//! backoff and never terminates on its own.

use super::{AcquireReply, Store, StoreCmd};
use crate::{CheckerError, Result};
use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delay between subscription retries after a connection failure
const SUBSCRIBE_RETRY: Duration = Duration::from_secs(5);

/// Buffered notifications per subscription before the ingest task backs up
const SUBSCRIBE_BUFFER: usize = 64;

/// Connection-managed Redis client
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to the store at `addr` (host:port or a full redis:// URL)
    ///
    /// Fails fast when the store is unreachable; startup is the only moment
    /// the checker refuses to run without it.
    pub async fn connect(addr: &str) -> Result<Self> {
        let url = if addr.contains("://") {
            addr.to_string()
        } else {
            format!("redis://{}", addr)
        };
        let client = redis::Client::open(url)
            .map_err(|e| CheckerError::StoreUnreachable(e.to_string()))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CheckerError::StoreUnreachable(e.to_string()))?;
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.hget(key, field).await?;
        Ok(value)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let _: () = conn.hdel(key, fields).await?;
        Ok(())
    }

    async fn acquire(
        &self,
        key: &str,
        lock_field: &str,
        sync_field: &str,
    ) -> Result<AcquireReply> {
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSETNX")
            .arg(key)
            .arg(lock_field)
            .arg(1)
            .cmd("HEXISTS")
            .arg(key)
            .arg(sync_field);
        let (acquired, sync_exists): (bool, bool) = pipe.query_async(&mut conn).await?;
        Ok(AcquireReply {
            acquired,
            sync_exists,
        })
    }

    async fn lindex(&self, key: &str, index: i64) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.lindex(key, index as isize).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.set(key, value).await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn exec_atomic(&self, cmds: &[StoreCmd]) -> Result<()> {
        if cmds.is_empty() {
            return Ok(());
        }
        let mut conn = self.manager.clone();
        let mut pipe = redis::pipe();
        pipe.atomic();
        for cmd in cmds {
            match cmd {
                StoreCmd::SetAdd { key, member } => {
                    pipe.cmd("SADD").arg(key).arg(member).ignore();
                }
                StoreCmd::SetRemove { key, member } => {
                    pipe.cmd("SREM").arg(key).arg(member).ignore();
                }
                StoreCmd::Expire { key, seconds } => {
                    pipe.cmd("EXPIRE").arg(key).arg(*seconds).ignore();
                }
            }
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(SUBSCRIBE_BUFFER);
        let client = self.client.clone();
        let channel = channel.to_string();
        tokio::spawn(async move {
            loop {
                let mut pubsub = match client.get_async_pubsub().await {
                    Ok(pubsub) => pubsub,
                    Err(e) => {
                        warn!("Cannot open subscriber connection: {}", e);
                        tokio::time::sleep(SUBSCRIBE_RETRY).await;
                        continue;
                    }
                };
                if let Err(e) = pubsub.subscribe(&channel).await {
                    warn!("Cannot subscribe to {:?}: {}", channel, e);
                    tokio::time::sleep(SUBSCRIBE_RETRY).await;
                    continue;
                }
                debug!("Subscribed to {:?}", channel);
                let mut messages = pubsub.on_message();
                while let Some(msg) = messages.next().await {
                    let payload: String = match msg.get_payload() {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!("Dropping undecodable message on {:?}: {}", channel, e);
                            continue;
                        }
                    };
                    if tx.send(payload).await.is_err() {
                        // Receiver gone, the process is shutting down
                        return;
                    }
                }
                warn!("Subscription to {:?} lost, reconnecting", channel);
                tokio::time::sleep(SUBSCRIBE_RETRY).await;
            }
        });
        Ok(rx)
    }
}
