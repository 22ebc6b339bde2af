use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{PacketQuery, RelayTransport, RemoteStatus, SubmitReceipt};
use crate::{
    config::{ChainConfig, RelayerConfig},
    packet::WireRequest,
    registry::ChainDirectory,
    types::{Asset, Channel, ChannelOrdering, ChannelState, ProtocolFamily, Route},
    ConfigurationError, Error,
};

const SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_BLOCKS_TO_SYNC: u64 = 100;
const IBC_DENOM_DECIMALS: u8 = 6;

/// 基于 HTTP 的中继传输，端点按链从目录中查找
pub struct HttpTransport {
    chains: Arc<ChainDirectory>,
    client: Client,
    admin_client: Client,
}

impl HttpTransport {
    pub fn new(chains: Arc<ChainDirectory>, config: &RelayerConfig) -> Result<Self, Error> {
        let build = |timeout: Duration| {
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| Error::Transport(format!("Failed to build HTTP client: {}", e)))
        };
        Ok(Self {
            chains,
            client: build(config.request_timeout())?,
            admin_client: build(config.admin_timeout())?,
        })
    }

    fn chain(&self, chain: &str) -> Result<ChainConfig, Error> {
        Ok(self.chains.get(chain)?)
    }

    fn relay_url(chain: &ChainConfig) -> Result<&str, Error> {
        chain.relay_chain_url.as_deref().ok_or_else(|| {
            Error::Config(format!("Chain {} has no relay chain url configured", chain.id))
        })
    }

    fn with_key(builder: RequestBuilder, chain: &ChainConfig) -> RequestBuilder {
        match &chain.api_key {
            Some(key) => builder.header("X-API-Key", key),
            None => builder,
        }
    }

    fn get(&self, chain: &ChainConfig, path: &str) -> RequestBuilder {
        Self::with_key(self.client.get(url(&chain.relayer_url, path)), chain)
    }

    fn post(&self, chain: &ChainConfig, path: &str) -> RequestBuilder {
        Self::with_key(self.client.post(url(&chain.relayer_url, path)), chain)
    }

    /// 发送请求；只有连不上或读不到响应时返回错误，状态码留给调用方判断
    async fn dispatch(&self, builder: RequestBuilder, what: &str) -> Result<(StatusCode, Value), Error> {
        let response = builder
            .send()
            .await
            .map_err(|e| Error::Transport(format!("{} failed: {}", what, e)))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("{}: failed to read response: {}", what, e)))?;
        let body = if text.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };
        debug!(what, status = status.as_u16(), "Relay responded");
        Ok((status, body))
    }

    async fn call(&self, builder: RequestBuilder, what: &str) -> Result<Value, Error> {
        let (status, body) = self.dispatch(builder, what).await?;
        classify(what, status, body)
    }
}

/// 状态码映射：2xx 成功（除非带 error 字段），5xx/429 可重试，其余 4xx 为协议拒绝
fn classify(what: &str, status: StatusCode, body: Value) -> Result<Value, Error> {
    let reason = error_reason(&body);
    if status.is_success() {
        return match reason {
            Some(reason) => Err(Error::ProtocolRejection {
                status: status.as_u16(),
                reason,
            }),
            None => Ok(body),
        };
    }
    let reason = reason
        .or_else(|| body.as_str().map(str::to_string))
        .unwrap_or_else(|| format!("{} failed with status: {}", what, status.as_u16()));
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::Transport(format!(
            "{} failed with status {}: {}",
            what,
            status.as_u16(),
            reason
        )));
    }
    Err(Error::ProtocolRejection {
        status: status.as_u16(),
        reason,
    })
}

fn error_reason(body: &Value) -> Option<String> {
    match body.get("error") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn url(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

/// 数字或十进制字符串
fn as_u64(value: &Value) -> Option<u64> {
    value
        .as_u64()
        .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
}

fn non_empty_str(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Deserialize)]
struct RemoteCounterparty {
    channel_id: String,
    port_id: String,
}

#[derive(Deserialize)]
struct RemoteChannel {
    channel_id: String,
    port_id: String,
    counterparty: RemoteCounterparty,
    #[serde(default)]
    state: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    ordering: String,
    #[serde(default)]
    connection_hops: Vec<String>,
}

impl RemoteChannel {
    fn into_channel(self, chain: &str) -> Channel {
        let mut channel = Channel::new(
            self.channel_id,
            self.port_id,
            self.counterparty.channel_id,
            self.counterparty.port_id,
            chain,
        );
        channel.state = ChannelState::from_remote(&self.state);
        channel.ordering = ChannelOrdering::from_remote(&self.ordering);
        if !self.version.is_empty() {
            channel.version = self.version;
        }
        channel.connection_hops = self.connection_hops;
        channel
    }
}

#[derive(Deserialize)]
struct DenomTrace {
    path: String,
    base_denom: String,
}

impl DenomTrace {
    /// ibc/<大写 hex(sha256(path/base_denom))>
    fn into_asset(self, chain: &str) -> Asset {
        let hash = Sha256::digest(format!("{}/{}", self.path, self.base_denom).as_bytes());
        let denom = format!("ibc/{}", hex::encode_upper(hash));
        Asset {
            id: denom.clone(),
            name: format!("IBC {}", self.base_denom),
            symbol: self.base_denom.to_uppercase(),
            decimals: IBC_DENOM_DECIMALS,
            origin_chain: chain.to_string(),
            location: Value::String(denom),
            metadata_uri: None,
        }
    }
}

fn list_field<T: serde::de::DeserializeOwned>(body: Value, field: &str) -> Result<Vec<T>, Error> {
    match body.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| Error::Serialization(format!("Failed to decode {}: {}", field, e))),
    }
}

#[async_trait]
impl RelayTransport for HttpTransport {
    async fn submit(&self, request: &WireRequest) -> Result<SubmitReceipt, Error> {
        let chain = self.chain(request.destination_chain())?;
        let (path, handle_field) = match request.family() {
            ProtocolFamily::Ibc => ("/ibc/packets", "tx_hash"),
            ProtocolFamily::Xcm => ("/api/xcm/send", "extrinsic_hash"),
        };
        let body = request.body()?;
        let response = self
            .call(self.post(&chain, path).json(&body), "Packet submission")
            .await?;

        let receipt = match response.get(handle_field).and_then(non_empty_str) {
            Some(handle) => SubmitReceipt {
                handle,
                from_remote: true,
            },
            None => SubmitReceipt {
                handle: request.message_id().to_string(),
                from_remote: false,
            },
        };
        info!(
            message_id = %request.message_id(),
            chain = %chain.id,
            handle = %receipt.handle,
            "Relay accepted submission"
        );
        Ok(receipt)
    }

    async fn query_status(&self, chain: &str, handle: &str) -> Result<RemoteStatus, Error> {
        let chain = self.chain(chain)?;
        let builder = match chain.protocol {
            ProtocolFamily::Ibc => self.get(&chain, &format!("/cosmos/tx/v1beta1/txs/{}", handle)),
            ProtocolFamily::Xcm => self.get(&chain, &format!("/api/xcm/message/{}", handle)),
        };
        let (status, body) = self.dispatch(builder, "Status query").await?;
        // 交易还未被索引
        if status == StatusCode::NOT_FOUND {
            return Ok(RemoteStatus::Pending);
        }
        let body = classify("Status query", status, body)?;

        let remote = match chain.protocol {
            ProtocolFamily::Ibc => match body.get("tx_response") {
                None | Some(Value::Null) => RemoteStatus::Pending,
                Some(tx) => match tx.get("code").and_then(as_u64).unwrap_or(0) {
                    0 => RemoteStatus::Success,
                    code => RemoteStatus::Failed(
                        tx.get("raw_log")
                            .and_then(non_empty_str)
                            .unwrap_or_else(|| format!("transaction failed with code {}", code)),
                    ),
                },
            },
            ProtocolFamily::Xcm => match body.get("status").and_then(Value::as_str) {
                Some("executed") | Some("success") => RemoteStatus::Success,
                Some("failed") | Some("error") => RemoteStatus::Failed(
                    body.get("failure_reason")
                        .and_then(non_empty_str)
                        .unwrap_or_else(|| "XCM execution failed".to_string()),
                ),
                _ => RemoteStatus::Pending,
            },
        };
        Ok(remote)
    }

    async fn latest_height(&self, chain: &str) -> Result<u64, Error> {
        let chain = self.chain(chain)?;
        if !chain.protocol.is_height_aware() {
            return Err(ConfigurationError::WrongProtocol {
                chain: chain.id,
                expected: ProtocolFamily::Ibc.to_string(),
            }
            .into());
        }
        let body = self
            .call(self.get(&chain, "/blocks/latest"), "Height query")
            .await?;
        as_u64(&body["block"]["header"]["height"]).ok_or_else(|| {
            Error::Serialization(format!("Chain {} reported no block height", chain.id))
        })
    }

    async fn packet_commitment(
        &self,
        chain: &str,
        port: &str,
        channel: &str,
        sequence: u64,
    ) -> Result<Option<String>, Error> {
        let chain = self.chain(chain)?;
        let path = format!(
            "/ibc/core/channel/v1/channels/{}/ports/{}/packet_commitments/{}",
            channel, port, sequence
        );
        let (status, body) = self.dispatch(self.get(&chain, &path), "Commitment query").await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = classify("Commitment query", status, body)?;
        Ok(body.get("commitment").and_then(non_empty_str))
    }

    async fn packet_received(&self, chain: &str, query: &PacketQuery) -> Result<bool, Error> {
        let chain = self.chain(chain)?;
        let body = self
            .call(self.post(&chain, "/ibc/packets/verify").json(query), "Packet verification")
            .await?;
        body.get("received").and_then(Value::as_bool).ok_or_else(|| {
            Error::Serialization("Verification response did not contain received status".to_string())
        })
    }

    async fn message_verified(&self, chain: &str, message_id: &str) -> Result<bool, Error> {
        let chain = self.chain(chain)?;
        let path = format!("/api/xcm/verify/{}", message_id);
        let body = self
            .call(self.post(&chain, &path), "Message verification")
            .await?;
        body.get("verified").and_then(Value::as_bool).ok_or_else(|| {
            Error::Serialization("Verification response did not contain verification status".to_string())
        })
    }

    async fn query_channels(&self, chain: &str) -> Result<Vec<Channel>, Error> {
        let chain = self.chain(chain)?;
        if chain.protocol != ProtocolFamily::Ibc {
            return Ok(Vec::new());
        }
        let body = self
            .call(self.get(&chain, "/ibc/core/channel/v1/channels"), "Channel query")
            .await?;
        let remote: Vec<RemoteChannel> = list_field(body, "channels")?;
        Ok(remote.into_iter().map(|c| c.into_channel(&chain.id)).collect())
    }

    async fn query_routes(&self, chain: &str) -> Result<Vec<Route>, Error> {
        let chain = self.chain(chain)?;
        if chain.protocol != ProtocolFamily::Xcm {
            return Ok(Vec::new());
        }
        let body = self
            .call(self.get(&chain, "/api/xcm/routes"), "Route query")
            .await?;
        list_field(body, "routes")
    }

    async fn query_assets(&self, chain: &str) -> Result<Vec<Asset>, Error> {
        let chain = self.chain(chain)?;
        match chain.protocol {
            ProtocolFamily::Ibc => {
                let body = self
                    .call(
                        self.get(&chain, "/ibc/apps/transfer/v1/denom_traces"),
                        "Denom trace query",
                    )
                    .await?;
                let traces: Vec<DenomTrace> = list_field(body, "denom_traces")?;
                Ok(traces.into_iter().map(|t| t.into_asset(&chain.id)).collect())
            }
            ProtocolFamily::Xcm => {
                let body = self
                    .call(self.get(&chain, "/api/xcm/assets"), "Asset query")
                    .await?;
                list_field(body, "assets")
            }
        }
    }

    async fn register_parachain(&self, chain: &str, parachain_id: u32, endpoint: &str) -> Result<(), Error> {
        let chain = self.chain(chain)?;
        let relay = Self::relay_url(&chain)?;
        let builder = Self::with_key(
            self.admin_client.post(url(relay, "/api/parachains/register")),
            &chain,
        )
        .json(&json!({
            "parachain_id": parachain_id,
            "parachain_endpoint": endpoint,
            "chain_id": chain.id,
        }));
        self.call(builder, "Parachain registration").await?;
        info!(chain = %chain.id, parachain_id, "Registered parachain with relay chain");
        Ok(())
    }

    async fn sync_relay_chain(&self, chain: &str, parachain_id: u32, last_sync_height: u64) -> Result<u64, Error> {
        let chain = self.chain(chain)?;
        let relay = Self::relay_url(&chain)?;
        let builder = Self::with_key(self.client.post(url(relay, "/api/sync")), &chain)
            .timeout(SYNC_TIMEOUT)
            .json(&json!({
                "parachain_id": parachain_id,
                "last_sync_height": last_sync_height,
                "max_blocks_to_sync": MAX_BLOCKS_TO_SYNC,
            }));
        let body = self.call(builder, "Relay chain sync").await?;
        match as_u64(&body["new_sync_height"]) {
            Some(height) => Ok(height),
            None => {
                warn!(chain = %chain.id, "Relay chain sync returned no height");
                Ok(last_sync_height)
            }
        }
    }
}
