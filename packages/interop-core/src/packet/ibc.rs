use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::debug;

use super::{Coin, IbcPacketData, IbcPacketRequest, Outbound, PacketBuilder, Requirement, WireRequest};
use crate::{
    config::LocalChainConfig,
    envelope::canonical_digest,
    registry::{AssetRegistry, ChannelRegistry},
    types::{Channel, Height, Message, Payload, ProtocolFamily},
    ConfigurationError, Error,
};

/// 有序通道构建器：ICS-20 转账或通用调用包
pub struct IbcPacketBuilder {
    local: LocalChainConfig,
    channels: Arc<ChannelRegistry>,
    assets: Arc<AssetRegistry>,
}

impl IbcPacketBuilder {
    pub fn new(
        local: LocalChainConfig,
        channels: Arc<ChannelRegistry>,
        assets: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            local,
            channels,
            assets,
        }
    }

    /// 调用方指定的通道必须通往目标链且处于 OPEN；否则按目标链查找
    fn select_channel(&self, destination: &str, preferred: Option<&str>) -> Result<Channel, Error> {
        let Some(id) = preferred else {
            return Ok(self.channels.channel_to(destination)?);
        };
        let channel = self
            .channels
            .get_channel(id)
            .map_err(|_| ConfigurationError::ChannelNotFound(id.to_string()))?;
        if channel.counterparty_chain != destination {
            return Err(ConfigurationError::ChannelNotFound(format!(
                "channel {} does not lead to {}",
                id, destination
            ))
            .into());
        }
        if !channel.is_open() {
            return Err(ConfigurationError::ChannelNotOpen {
                channel: channel.channel_id,
                state: channel.state.to_string(),
            }
            .into());
        }
        Ok(channel)
    }

    fn packet_data(&self, payload: &Payload) -> Result<IbcPacketData, Error> {
        payload.validate()?;
        let data = match payload {
            Payload::Transfer {
                asset,
                amount,
                recipient,
            } => {
                let asset = self.assets.get_asset(asset)?;
                IbcPacketData::Transfer {
                    token: Coin {
                        denom: asset.denom().to_string(),
                        amount: *amount,
                    },
                    receiver: recipient.clone(),
                }
            }
            Payload::Call {
                encoded_call,
                weight,
            } => IbcPacketData::Call {
                call_data: encoded_call.clone(),
                max_gas: *weight,
            },
        };
        Ok(data)
    }
}

impl PacketBuilder for IbcPacketBuilder {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Ibc
    }

    fn requirement(&self) -> Requirement {
        Requirement::Channel
    }

    fn preflight(
        &self,
        _source: &str,
        destination: &str,
        payload: &Payload,
        channel: Option<&str>,
    ) -> Result<(), Error> {
        self.packet_data(payload)?;
        self.select_channel(destination, channel)?;
        Ok(())
    }

    fn build(&self, message: &Message) -> Result<Outbound, Error> {
        let data = self.packet_data(&message.payload)?;
        let channel = self.select_channel(&message.destination_chain, message.source_channel.as_deref())?;

        let timeout_height = message
            .timeout
            .height
            .or(channel.timeout_height)
            .unwrap_or_default();
        let timeout_timestamp = match message.timeout.timestamp {
            0 => channel.timeout_timestamp.unwrap_or(0),
            ts => ts,
        };
        if timeout_height.revision_height == 0 && timeout_timestamp == 0 {
            return Err(ConfigurationError::InvalidTimeout(format!(
                "packet on {} has neither a timeout height nor a timeout timestamp",
                channel.channel_id
            ))
            .into());
        }

        let data_digest = canonical_digest(&data)?;

        // 所有校验通过后才分配序号，失败的构建不会留下空洞
        let sequence = self.channels.next_sequence(&channel.channel_id)?;
        let commitment = packet_commitment(&timeout_height, timeout_timestamp, &data_digest);

        let memo = message.memo.clone().unwrap_or_else(|| {
            format!(
                "IBC {} from {} to {}",
                message.kind(),
                self.local.id,
                message.destination_chain
            )
        });

        let request = IbcPacketRequest {
            message_id: message.id.clone(),
            destination_chain_id: message.destination_chain.clone(),
            source_port: channel.port_id.clone(),
            source_channel: channel.channel_id.clone(),
            destination_port: channel.counterparty_port_id.clone(),
            destination_channel: channel.counterparty_channel_id.clone(),
            sender: self.local.account_address.clone(),
            data,
            timeout_height,
            timeout_timestamp,
            packet_sequence: sequence,
            memo: memo.clone(),
        };

        let mut built = message.clone();
        built.source_channel = Some(channel.channel_id.clone());
        built.destination_channel = Some(channel.counterparty_channel_id.clone());
        built.source_port = Some(channel.port_id.clone());
        built.destination_port = Some(channel.counterparty_port_id.clone());
        built.sequence = Some(sequence);
        built.memo = Some(memo);
        built.relayer_address = Some(self.local.account_address.clone());
        built.timeout.height = Some(timeout_height);
        built.timeout.timestamp = timeout_timestamp;
        built.commitment = Some(commitment);

        debug!(
            message_id = %built.id,
            channel = %channel.channel_id,
            sequence,
            "Built IBC packet"
        );

        Ok(Outbound {
            message: built,
            request: WireRequest::Ibc(request),
        })
    }
}

/// 包承诺：sha256(超时时间戳 ‖ 修订号 ‖ 修订高度 ‖ sha256(包数据))，均为大端
pub fn packet_commitment(timeout_height: &Height, timeout_timestamp: u64, data_digest: &[u8; 32]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timeout_timestamp.to_be_bytes());
    hasher.update(timeout_height.revision_number.to_be_bytes());
    hasher.update(timeout_height.revision_height.to_be_bytes());
    hasher.update(data_digest);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::types::ChannelState;

    fn builder() -> (IbcPacketBuilder, Arc<ChannelRegistry>) {
        let ctx = context();
        let channels = ctx.channels.clone();
        (IbcPacketBuilder::new(ctx.local, ctx.channels, ctx.assets), channels)
    }

    #[test]
    fn test_transfer_carries_denom_and_amount_verbatim() {
        let (builder, _) = builder();
        let outbound = builder
            .build(&message("cosmoshub", Payload::transfer("usdc", 100, "cosmos1bob").unwrap()))
            .unwrap();

        let WireRequest::Ibc(request) = &outbound.request else {
            panic!("expected an IBC request");
        };
        assert_eq!(request.source_channel, "ch-1");
        assert_eq!(request.destination_channel, "channel-7");
        assert_eq!(request.source_port, "transfer");
        assert_eq!(request.sender, "tp1sender");
        assert_eq!(request.packet_sequence, 5);
        assert_eq!(request.timeout_height, Height::new(0, 2_000));
        assert_eq!(request.memo, "IBC transfer from tracepost to cosmoshub");
        match &request.data {
            IbcPacketData::Transfer { token, receiver } => {
                assert_eq!(token.amount, 100);
                assert_eq!(token.denom, "usdc");
                assert_eq!(receiver, "cosmos1bob");
            }
            other => panic!("unexpected packet data {:?}", other),
        }
        assert_eq!(outbound.request.amount(), Some(100));
        assert_eq!(outbound.message.sequence, Some(5));
        assert!(outbound.message.commitment.is_some());
    }

    #[test]
    fn test_unregistered_asset_does_not_consume_sequence() {
        let (builder, channels) = builder();
        let err = builder
            .build(&message("cosmoshub", Payload::transfer("unknown", 1, "cosmos1bob").unwrap()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Configuration(ConfigurationError::UnregisteredAsset(_))
        ));
        assert_eq!(channels.get_channel("ch-1").unwrap().next_sequence, 5);
    }

    #[test]
    fn test_closed_channel_is_rejected() {
        let (builder, channels) = builder();
        let mut closed = channels.get_channel("ch-1").unwrap();
        closed.state = ChannelState::Closed;
        channels.register_channel(closed);

        let payload = Payload::transfer("usdc", 1, "cosmos1bob").unwrap();
        assert!(matches!(
            builder.preflight("tracepost", "cosmoshub", &payload, None),
            Err(Error::Configuration(ConfigurationError::ChannelNotOpen { .. }))
        ));
        assert!(builder.build(&message("cosmoshub", payload)).is_err());
        assert_eq!(channels.get_channel("ch-1").unwrap().next_sequence, 5);
    }

    #[test]
    fn test_preferred_channel_must_reach_destination() {
        let (builder, _) = builder();
        let payload = Payload::call("0x0102", 50_000).unwrap();
        assert!(builder
            .preflight("tracepost", "cosmoshub", &payload, Some("ch-1"))
            .is_ok());
        assert!(builder
            .preflight("tracepost", "osmosis", &payload, Some("ch-1"))
            .is_err());
        assert!(builder
            .preflight("tracepost", "cosmoshub", &payload, Some("ch-9"))
            .is_err());
    }

    #[test]
    fn test_call_packet_uses_weight_as_gas() {
        let (builder, _) = builder();
        let outbound = builder
            .build(&message("cosmoshub", Payload::call("0xdeadbeef", 75_000).unwrap()))
            .unwrap();
        let WireRequest::Ibc(request) = outbound.request else {
            panic!("expected an IBC request");
        };
        assert_eq!(
            request.data,
            IbcPacketData::Call {
                call_data: "0xdeadbeef".into(),
                max_gas: 75_000
            }
        );
        assert_eq!(request.memo, "IBC call from tracepost to cosmoshub");
    }

    #[test]
    fn test_missing_timeout_is_rejected() {
        let (builder, channels) = builder();
        let mut msg = message("cosmoshub", Payload::transfer("usdc", 1, "cosmos1bob").unwrap());
        msg.timeout.height = None;
        msg.timeout.timestamp = 0;
        assert!(matches!(
            builder.build(&msg),
            Err(Error::Configuration(ConfigurationError::InvalidTimeout(_)))
        ));
        assert_eq!(channels.get_channel("ch-1").unwrap().next_sequence, 5);
    }

    #[test]
    fn test_concurrent_builds_get_five_and_six() {
        let (builder, channels) = builder();
        let builder = Arc::new(builder);

        let mut sequences: Vec<u64> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..2)
                .map(|i| {
                    let builder = builder.clone();
                    s.spawn(move || {
                        let payload = Payload::transfer("usdc", 100 + i, "cosmos1bob").unwrap();
                        builder
                            .build(&message("cosmoshub", payload))
                            .unwrap()
                            .message
                            .sequence
                            .unwrap()
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        sequences.sort();
        assert_eq!(sequences, vec![5, 6]);
        assert_eq!(channels.get_channel("ch-1").unwrap().next_sequence, 7);
    }

    #[test]
    fn test_commitment_depends_on_timeout_and_data() {
        let digest = [7u8; 32];
        let a = packet_commitment(&Height::new(0, 10), 5, &digest);
        let b = packet_commitment(&Height::new(0, 11), 5, &digest);
        let c = packet_commitment(&Height::new(0, 10), 5, &[8u8; 32]);
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, packet_commitment(&Height::new(0, 10), 5, &digest));
    }
}
