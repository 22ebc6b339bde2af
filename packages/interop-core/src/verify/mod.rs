//! 状态与投递验证引擎：提交重试、状态对账、承诺交叉校验。

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    config::RelayerConfig,
    envelope::HeightSource,
    packet::{Outbound, WireRequest},
    registry::ChannelRegistry,
    transport::{PacketQuery, RelayTransport, RemoteStatus},
    types::{ChainId, Message, MessageStatus, ProtocolFamily},
    Error,
};

/// 指数退避：第 n 次失败后等待 base * 2^(n-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &RelayerConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_delay: config.retry_delay(),
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RelayerConfig::default())
    }
}

/// 投递证明的引用
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryRef {
    /// 有序通道：按 (端口, 通道, 序号) 定位包，可附带期望的承诺
    Packet {
        port: String,
        channel: String,
        sequence: u64,
        expected_commitment: Option<String>,
    },
    /// 指令列表消息：按消息 ID 在目标链上查验
    Message {
        destination_chain: ChainId,
        message_id: String,
    },
}

impl DeliveryRef {
    fn cache_key(&self, source_chain: &str) -> String {
        match self {
            DeliveryRef::Packet {
                port,
                channel,
                sequence,
                expected_commitment,
            } => {
                let commitment = expected_commitment
                    .as_deref()
                    .map(normalize_commitment)
                    .unwrap_or_default();
                format!("{}/{}/{}/{}#{}", source_chain, port, channel, sequence, commitment)
            }
            DeliveryRef::Message {
                destination_chain,
                message_id,
            } => format!("{}/{}/{}", source_chain, destination_chain, message_id),
        }
    }
}

struct CachedHeight {
    height: u64,
    fetched_at: Instant,
}

pub struct StatusEngine {
    transport: Arc<dyn RelayTransport>,
    channels: Arc<ChannelRegistry>,
    policy: RetryPolicy,
    height_ttl: Duration,
    verification_ttl: Duration,
    heights: RwLock<HashMap<ChainId, CachedHeight>>,
    verified: RwLock<HashMap<String, Instant>>,
}

impl StatusEngine {
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        channels: Arc<ChannelRegistry>,
        config: &RelayerConfig,
    ) -> Self {
        Self::with_policy(transport, channels, config, RetryPolicy::from_config(config))
    }

    pub fn with_policy(
        transport: Arc<dyn RelayTransport>,
        channels: Arc<ChannelRegistry>,
        config: &RelayerConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            channels,
            policy,
            height_ttl: config.height_cache_ttl(),
            verification_ttl: config.verification_cache_ttl(),
            heights: RwLock::new(HashMap::new()),
            verified: RwLock::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 传输层失败按退避重试，超过次数后让调用方稍后再试
    async fn with_retry<F, Fut, T>(&self, what: &str, attempts: &mut u32, operation: F) -> Result<T, Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            *attempts = attempts.saturating_add(1);
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() => {
                    if tries >= self.policy.max_attempts {
                        warn!(what, attempts = tries, error = %e, "Giving up for now");
                        return Err(Error::RetryLater {
                            attempts: tries,
                            last_error: e.to_string(),
                        });
                    }
                    let delay = self.policy.delay_for(tries);
                    debug!(what, attempt = tries, ?delay, error = %e, "Retrying after backoff");
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 提交一条 pending 消息。
    ///
    /// 成功后为 submitted；协议拒绝后为 rejected 并返回拒绝原因；传输失败时保持 pending。
    /// 已过超时的消息不再发出，直接记为 timed_out 并返回 `TimeoutExpired`。
    pub async fn submit(&self, outbound: &mut Outbound) -> Result<(), Error> {
        let Outbound { message, request } = outbound;
        if message.status != MessageStatus::Pending {
            return Err(Error::InvalidTransition {
                from: message.status,
                to: MessageStatus::Submitted,
            });
        }
        if self.is_expired(message).await {
            message.mark_timed_out()?;
            warn!(message_id = %message.id, "Message timed out before submission");
            return Err(Error::TimeoutExpired(message.id.clone()));
        }
        let request: &WireRequest = request;
        let result = self
            .with_retry("submit", &mut message.attempts, || self.transport.submit(request))
            .await;

        match result {
            Ok(receipt) => {
                message.mark_submitted(receipt.handle)?;
                info!(
                    message_id = %message.id,
                    handle = ?message.tx_handle,
                    attempts = message.attempts,
                    "Message submitted"
                );
                Ok(())
            }
            Err(Error::ProtocolRejection { status, reason }) => {
                message.mark_rejected(reason.clone())?;
                warn!(message_id = %message.id, status, %reason, "Relay rejected message");
                Err(Error::ProtocolRejection { status, reason })
            }
            Err(e) => Err(e),
        }
    }

    /// 推进一条消息的状态，返回新状态。终态消息原样返回。
    pub async fn poll_status(&self, outbound: &mut Outbound) -> Result<MessageStatus, Error> {
        match outbound.message.status {
            MessageStatus::Pending => match self.submit(outbound).await {
                Ok(())
                | Err(Error::ProtocolRejection { .. })
                | Err(Error::TimeoutExpired(_)) => Ok(outbound.message.status),
                Err(e) => Err(e),
            },
            MessageStatus::Submitted => {
                self.reconcile(&mut outbound.message).await?;
                Ok(outbound.message.status)
            }
            status => Ok(status),
        }
    }

    async fn reconcile(&self, message: &mut Message) -> Result<(), Error> {
        let handle = message.tx_handle.clone().unwrap_or_else(|| message.id.clone());
        let destination = message.destination_chain.clone();
        let mut queries = 0;
        let remote = self
            .with_retry("query_status", &mut queries, || {
                self.transport.query_status(&destination, &handle)
            })
            .await?;

        match remote {
            RemoteStatus::Success => self.confirm(message).await,
            RemoteStatus::Failed(reason) => {
                warn!(message_id = %message.id, %reason, "Destination reported failure");
                message.mark_rejected(reason)
            }
            RemoteStatus::Pending => {
                if self.is_expired(message).await {
                    message.mark_timed_out()?;
                    warn!(message_id = %message.id, "Message timed out without acknowledgement");
                }
                Ok(())
            }
        }
    }

    /// 远端报告成功后，若有本地承诺则以目标链报告的承诺为准
    async fn confirm(&self, message: &mut Message) -> Result<(), Error> {
        if let (Some(expected), Some(port), Some(channel), Some(sequence)) = (
            message.commitment.clone(),
            message.source_port.clone(),
            message.source_channel.clone(),
            message.sequence,
        ) {
            let remote = self
                .transport
                .packet_commitment(&message.destination_chain, &port, &channel, sequence)
                .await?;
            match remote {
                Some(remote) if same_commitment(&remote, &expected) => {}
                Some(remote) => {
                    error!(
                        message_id = %message.id,
                        %expected,
                        %remote,
                        "Packet commitment mismatch"
                    );
                    return message.mark_rejected(format!(
                        "commitment mismatch: expected {}, destination reported {}",
                        expected, remote
                    ));
                }
                None => {
                    debug!(message_id = %message.id, "No commitment reported, using status flag");
                }
            }
        }
        if message.acknowledge()? {
            info!(message_id = %message.id, "Message acknowledged");
        } else {
            warn!(message_id = %message.id, status = %message.status, "Discarding late acknowledgement");
        }
        Ok(())
    }

    async fn is_expired(&self, message: &Message) -> bool {
        if message.is_expired(None) {
            return true;
        }
        match message.timeout.height {
            Some(height) if height.revision_height != 0 => {
                match self.cached_height(&message.destination_chain).await {
                    Ok(current) => message.is_expired(Some(current)),
                    Err(e) => {
                        debug!(chain = %message.destination_chain, error = %e, "Height unavailable for expiry check");
                        false
                    }
                }
            }
            _ => false,
        }
    }

    /// 带 TTL 缓存的远端高度；查询期间不持有锁
    pub async fn cached_height(&self, chain: &str) -> Result<u64, Error> {
        if let Some(cached) = self.heights.read().get(chain) {
            if cached.fetched_at.elapsed() < self.height_ttl {
                return Ok(cached.height);
            }
        }
        let height = self.transport.latest_height(chain).await?;
        self.heights.write().insert(
            chain.to_string(),
            CachedHeight {
                height,
                fetched_at: Instant::now(),
            },
        );
        debug!(chain, height, "Refreshed remote height");
        Ok(height)
    }

    /// 查验投递。
    ///
    /// 肯定的结果在 TTL 内缓存，缓存键包含期望的承诺。带期望承诺的查询只有在
    /// 承诺比对成功后才写入缓存。
    pub async fn verify_delivery(&self, source_chain: &str, reference: &DeliveryRef) -> Result<bool, Error> {
        let key = reference.cache_key(source_chain);
        if let Some(at) = self.verified.read().get(&key) {
            if at.elapsed() < self.verification_ttl {
                debug!(%key, "Verification cache hit");
                return Ok(true);
            }
        }

        let (delivered, cacheable) = match reference {
            DeliveryRef::Packet {
                port,
                channel,
                sequence,
                expected_commitment,
            } => {
                let meta = self.channels.get_channel(channel)?;
                let counterparty = meta.counterparty_chain.clone();
                let commitment = match expected_commitment {
                    Some(_) => {
                        self.transport
                            .packet_commitment(&counterparty, port, channel, *sequence)
                            .await?
                    }
                    None => None,
                };
                match (commitment, expected_commitment) {
                    (Some(remote), Some(expected)) => {
                        let matches = same_commitment(&remote, expected);
                        if !matches {
                            error!(%channel, sequence, %expected, %remote, "Packet commitment mismatch");
                        }
                        (matches, true)
                    }
                    _ => {
                        let query = PacketQuery {
                            source_chain_id: source_chain.to_string(),
                            source_channel: channel.clone(),
                            destination_channel: meta.counterparty_channel_id.clone(),
                            packet_sequence: *sequence,
                        };
                        let received = self.transport.packet_received(&counterparty, &query).await?;
                        (received, expected_commitment.is_none())
                    }
                }
            }
            DeliveryRef::Message {
                destination_chain,
                message_id,
            } => (
                self.transport.message_verified(destination_chain, message_id).await?,
                true,
            ),
        };

        if delivered && cacheable {
            self.verified.write().insert(key, Instant::now());
        }
        Ok(delivered)
    }

    /// 目标链上 (端口, 通道, 序号) 的包承诺
    pub async fn packet_commitment(
        &self,
        chain: &str,
        port: &str,
        channel: &str,
        sequence: u64,
    ) -> Result<Option<String>, Error> {
        self.transport.packet_commitment(chain, port, channel, sequence).await
    }

    /// 按消息生成投递引用
    pub fn delivery_ref(message: &Message, family: ProtocolFamily) -> Option<DeliveryRef> {
        match family {
            ProtocolFamily::Ibc => Some(DeliveryRef::Packet {
                port: message.source_port.clone()?,
                channel: message.source_channel.clone()?,
                sequence: message.sequence?,
                expected_commitment: message.commitment.clone(),
            }),
            ProtocolFamily::Xcm => Some(DeliveryRef::Message {
                destination_chain: message.destination_chain.clone(),
                message_id: message.id.clone(),
            }),
        }
    }
}

#[async_trait]
impl HeightSource for StatusEngine {
    async fn current_height(&self, chain: &str) -> Result<u64, Error> {
        self.cached_height(chain).await
    }
}

fn normalize_commitment(raw: &str) -> String {
    raw.trim().trim_start_matches("0x").to_ascii_lowercase()
}

fn same_commitment(a: &str, b: &str) -> bool {
    normalize_commitment(a) == normalize_commitment(b)
}

/// 截止时刻前剩余的时间；已到期时返回 `DeadlineExceeded`
pub fn remaining(deadline: Option<Instant>) -> Result<Option<Duration>, Error> {
    match deadline {
        Some(at) => at
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .map(Some)
            .ok_or(Error::DeadlineExceeded),
        None => Ok(None),
    }
}

/// 在调用方给定的期限内运行；超时即放弃，不产生部分结果
pub async fn with_deadline<T, F>(deadline: Option<Duration>, operation: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, operation)
            .await
            .map_err(|_| Error::DeadlineExceeded)?,
        None => operation.await,
    }
}
