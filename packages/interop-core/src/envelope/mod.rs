//! 消息信封：确定性消息 ID 与超时计算。

use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use crate::{
    registry::{ChainDirectory, TrustRegistry},
    types::{now_nanos, now_secs, Height, Message, MessageId, MessageStatus, Payload, Timeout},
    ConfigurationError, Error,
};

/// 规范化序列化后的 sha256。
///
/// 先转成 `serde_json::Value`，对象键按字典序排列，同一内容总是得到同一摘要。
pub fn canonical_digest<T: Serialize + ?Sized>(value: &T) -> Result<[u8; 32], Error> {
    let canonical = serde_json::to_value(value)
        .and_then(|v| serde_json::to_vec(&v))
        .map_err(|e| Error::Serialization(e.to_string()))?;
    let mut digest = [0u8; 32];
    digest.copy_from_slice(&Sha256::digest(&canonical));
    Ok(digest)
}

/// 消息 ID：源链、目标链与负载的内容哈希，也是重试时的幂等键
pub fn message_id(source: &str, destination: &str, payload: &Payload) -> Result<MessageId, Error> {
    let digest = canonical_digest(&json!({
        "source": source,
        "destination": destination,
        "payload": payload,
    }))?;
    Ok(hex::encode(digest))
}

/// `cosmoshub-4` 这类链 ID 的修订号；没有后缀时为 0
pub fn revision_number(chain_id: &str) -> u64 {
    chain_id
        .rsplit_once('-')
        .and_then(|(_, suffix)| suffix.parse().ok())
        .unwrap_or(0)
}

/// 远端链当前高度的来源
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HeightSource: Send + Sync {
    async fn current_height(&self, chain: &str) -> Result<u64, Error>;
}

pub struct EnvelopeBuilder {
    chains: Arc<ChainDirectory>,
    trust: Arc<TrustRegistry>,
    heights: Arc<dyn HeightSource>,
    block_margin: u64,
}

impl EnvelopeBuilder {
    pub fn new(
        chains: Arc<ChainDirectory>,
        trust: Arc<TrustRegistry>,
        heights: Arc<dyn HeightSource>,
        block_margin: u64,
    ) -> Self {
        Self {
            chains,
            trust,
            heights,
            block_margin,
        }
    }

    pub fn block_margin(&self) -> u64 {
        self.block_margin
    }

    /// 构建处于 pending 的消息。
    ///
    /// 高度感知的协议会查询远端高度并加上区块余量；信任参数过期时拒绝构建新的超时。
    pub async fn build_envelope(
        &self,
        source: &str,
        destination: &str,
        payload: Payload,
        timeout_minutes: u64,
    ) -> Result<Message, Error> {
        payload.validate()?;
        if timeout_minutes == 0 {
            return Err(ConfigurationError::InvalidTimeout(
                "timeout must be at least one minute".to_string(),
            )
            .into());
        }
        let family = self.chains.family(destination)?;
        let id = message_id(source, destination, &payload)?;

        let timeout_secs = timeout_minutes.saturating_mul(60);
        let timestamp = now_nanos().saturating_add(timeout_secs.saturating_mul(1_000_000_000));

        let observed = if family.is_height_aware() {
            Some(self.heights.current_height(destination).await?)
        } else {
            None
        };

        let now = now_secs();
        self.trust.check_fresh(destination, now, timeout_secs, observed)?;
        if let Some(height) = observed {
            self.trust.record_verified(destination, height, now);
        }

        let height = observed.map(|h| {
            Height::new(revision_number(destination), h).add(self.block_margin)
        });

        debug!(
            message_id = %id,
            destination,
            kind = %payload.kind(),
            timeout_height = ?height,
            "Built message envelope"
        );

        Ok(Message {
            id,
            source_chain: source.to_string(),
            destination_chain: destination.to_string(),
            source_channel: None,
            destination_channel: None,
            source_port: None,
            destination_port: None,
            payload,
            created_at: now,
            timeout: Timeout { height, timestamp },
            status: MessageStatus::Pending,
            sequence: None,
            weight: None,
            memo: None,
            relayer_address: None,
            fee: None,
            tx_handle: None,
            failure_reason: None,
            commitment: None,
            attempts: 0,
        })
    }
}
