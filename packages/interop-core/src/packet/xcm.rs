use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use super::{
    AssetFilter, EncodedCall, MultiAsset, OriginKind, Outbound, PacketBuilder, Requirement,
    WeightLimit, WildAsset, WireRequest, XcmInstruction, XcmRequest,
};
use crate::{
    config::LocalChainConfig,
    registry::{AssetRegistry, ChainDirectory, RouteRegistry},
    types::{FeeMetadata, Message, Payload, ProtocolFamily, Route, RouteStatus},
    ConfigurationError, Error,
};

const XCM_VERSION: &str = "V3";
const SEND_CALL: &str = "xcmPallet.send";

/// 指令列表构建器：按消息类型生成 XCM v3 指令序列
pub struct XcmPacketBuilder {
    local: LocalChainConfig,
    chains: Arc<ChainDirectory>,
    routes: Arc<RouteRegistry>,
    assets: Arc<AssetRegistry>,
}

/// 路由解析后的寻址信息
struct Addressing {
    route: Route,
    destination_para_id: Option<u32>,
    /// 仅多跳路由在请求中携带
    tagged: bool,
}

impl XcmPacketBuilder {
    pub fn new(
        local: LocalChainConfig,
        chains: Arc<ChainDirectory>,
        routes: Arc<RouteRegistry>,
        assets: Arc<AssetRegistry>,
    ) -> Self {
        Self {
            local,
            chains,
            routes,
            assets,
        }
    }

    fn address(&self, source: &str, destination: &str) -> Result<Addressing, Error> {
        let chain = self.chains.get(destination)?;
        if chain.protocol != ProtocolFamily::Xcm {
            return Err(ConfigurationError::WrongProtocol {
                chain: destination.to_string(),
                expected: ProtocolFamily::Xcm.to_string(),
            }
            .into());
        }

        let route = self.routes.resolve_route(source, destination)?;
        match route.status {
            RouteStatus::Disabled => {
                return Err(ConfigurationError::RouteDisabled {
                    origin: source.to_string(),
                    destination: destination.to_string(),
                }
                .into())
            }
            RouteStatus::Degraded => {
                warn!(source, destination, "Building over a degraded route");
            }
            RouteStatus::Active => {}
        }

        if !route.is_multi_hop() {
            return Ok(Addressing {
                route,
                destination_para_id: chain.parachain_id,
                tagged: false,
            });
        }

        let para_id = route
            .hop_for(destination)
            .map(|hop| hop.para_id)
            .ok_or_else(|| ConfigurationError::UnroutableHop {
                origin: source.to_string(),
                destination: destination.to_string(),
                chain: destination.to_string(),
            })?;
        Ok(Addressing {
            destination_para_id: para_id.or(chain.parachain_id),
            route,
            tagged: true,
        })
    }

    /// 手续费资产：路由指定的优先，否则用被转账资产本身
    fn fee_for(&self, route: &Route, fallback: Option<(&str, &Value, u128)>) -> Result<Option<(FeeMetadata, Value)>, Error> {
        let (asset_id, location) = match (&route.fee_asset, fallback) {
            (Some(id), _) => {
                let asset = self.assets.get_asset(id)?;
                (asset.id, asset.location)
            }
            (None, Some((id, location, _))) => (id.to_string(), location.clone()),
            (None, None) => return Ok(None),
        };
        let amount = match (route.fee_amount, fallback) {
            (Some(fee), _) => fee,
            // 默认按金额的 1% 购买执行
            (None, Some((_, _, amount))) => (amount / 100).max(1),
            (None, None) => return Ok(None),
        };
        Ok(Some((
            FeeMetadata {
                asset: asset_id,
                amount,
            },
            location,
        )))
    }

    fn instructions(
        &self,
        payload: &Payload,
        route: &Route,
    ) -> Result<(Vec<XcmInstruction>, Option<FeeMetadata>), Error> {
        payload.validate()?;
        match payload {
            Payload::Transfer {
                asset,
                amount,
                recipient,
            } => {
                let asset = self.assets.get_asset(asset)?;
                let fee = self.fee_for(route, Some((asset.id.as_str(), &asset.location, *amount)))?;
                let Some((fee, fee_location)) = fee else {
                    return Err(ConfigurationError::InvalidPayload(
                        "transfer has no fee asset".to_string(),
                    )
                    .into());
                };
                let instructions = vec![
                    XcmInstruction::ReserveAssetDeposited(vec![MultiAsset::fungible(
                        asset.location.clone(),
                        *amount,
                    )]),
                    XcmInstruction::ClearOrigin,
                    XcmInstruction::BuyExecution {
                        fees: MultiAsset::fungible(fee_location, fee.amount),
                        weight_limit: WeightLimit::Unlimited,
                    },
                    XcmInstruction::DepositAsset {
                        assets: AssetFilter::Wild(WildAsset::AllCounted(1)),
                        beneficiary: beneficiary(recipient),
                    },
                ];
                Ok((instructions, Some(fee)))
            }
            Payload::Call {
                encoded_call,
                weight,
            } => {
                let fee = self.fee_for(route, None)?.map(|(fee, _)| fee);
                let instructions = vec![XcmInstruction::Transact {
                    origin_kind: OriginKind::SovereignAccount,
                    require_weight_at_most: *weight,
                    call: EncodedCall {
                        encoded: encoded_call.clone(),
                    },
                }];
                Ok((instructions, fee))
            }
        }
    }
}

impl PacketBuilder for XcmPacketBuilder {
    fn family(&self) -> ProtocolFamily {
        ProtocolFamily::Xcm
    }

    fn requirement(&self) -> Requirement {
        Requirement::Route
    }

    fn preflight(
        &self,
        source: &str,
        destination: &str,
        payload: &Payload,
        _channel: Option<&str>,
    ) -> Result<(), Error> {
        let addressing = self.address(source, destination)?;
        self.instructions(payload, &addressing.route)?;
        Ok(())
    }

    fn build(&self, message: &Message) -> Result<Outbound, Error> {
        let addressing = self.address(&message.source_chain, &message.destination_chain)?;
        let (instructions, fee) = self.instructions(&message.payload, &addressing.route)?;

        if message.timeout.timestamp == 0 {
            return Err(ConfigurationError::InvalidTimeout(format!(
                "XCM message to {} has no timeout timestamp",
                message.destination_chain
            ))
            .into());
        }

        let weight = match &message.payload {
            Payload::Call { weight, .. } => Some(*weight),
            Payload::Transfer { .. } => None,
        };

        let request = XcmRequest {
            message_id: message.id.clone(),
            source_chain_id: message.source_chain.clone(),
            destination_chain_id: message.destination_chain.clone(),
            message_type: message.kind(),
            xcm_version: XCM_VERSION.to_string(),
            call: SEND_CALL.to_string(),
            destination: destination_location(addressing.destination_para_id),
            instructions,
            weight,
            source_para_id: if addressing.tagged {
                self.local.parachain_id
            } else {
                None
            },
            destination_para_id: if addressing.tagged {
                addressing.destination_para_id
            } else {
                None
            },
            timeout_timestamp: message.timeout.timestamp,
        };

        let mut built = message.clone();
        built.weight = weight;
        built.fee = fee;
        built.relayer_address = Some(self.local.account_address.clone());
        // XCM 没有高度超时
        built.timeout.height = None;

        debug!(
            message_id = %built.id,
            destination = %built.destination_chain,
            instructions = request.instructions.len(),
            multi_hop = addressing.tagged,
            "Built XCM message"
        );

        Ok(Outbound {
            message: built,
            request: WireRequest::Xcm(request),
        })
    }
}

/// 相对本平行链：上一级到中继链，再进入目标平行链
fn destination_location(para_id: Option<u32>) -> Value {
    match para_id {
        Some(id) => json!({ "parents": 1, "interior": { "X1": { "Parachain": id } } }),
        None => json!({ "parents": 1, "interior": "Here" }),
    }
}

fn beneficiary(account: &str) -> Value {
    json!({
        "parents": 0,
        "interior": { "X1": { "AccountId32": { "id": account, "network": "Any" } } }
    })
}

#[cfg(test)]
mod tests {
    use super::super::fixtures::*;
    use super::*;
    use crate::types::{Asset, RouteHop, RouteType};

    fn builder_with(routes: Vec<Route>) -> XcmPacketBuilder {
        let ctx = context();
        for route in routes {
            ctx.routes.register_route(route);
        }
        XcmPacketBuilder::new(ctx.local, ctx.chains, ctx.routes, ctx.assets)
    }

    fn xcm(outbound: &Outbound) -> &XcmRequest {
        match &outbound.request {
            WireRequest::Xcm(request) => request,
            other => panic!("expected an XCM request, got {:?}", other),
        }
    }

    #[test]
    fn test_transfer_instruction_shape() {
        let builder = builder_with(vec![]);
        let outbound = builder
            .build(&message("moonbeam", Payload::transfer("usdc", 1_000, "0xbeef").unwrap()))
            .unwrap();
        let request = xcm(&outbound);

        assert_eq!(request.xcm_version, "V3");
        assert_eq!(request.call, "xcmPallet.send");
        assert_eq!(
            request.destination,
            json!({ "parents": 1, "interior": { "X1": { "Parachain": 2004 } } })
        );
        assert_eq!(request.source_para_id, None);
        assert_eq!(request.destination_para_id, None);

        let usdc_location = usdc().location;
        assert_eq!(
            request.instructions,
            vec![
                XcmInstruction::ReserveAssetDeposited(vec![MultiAsset::fungible(
                    usdc_location.clone(),
                    1_000
                )]),
                XcmInstruction::ClearOrigin,
                XcmInstruction::BuyExecution {
                    fees: MultiAsset::fungible(usdc_location, 10),
                    weight_limit: WeightLimit::Unlimited,
                },
                XcmInstruction::DepositAsset {
                    assets: AssetFilter::Wild(WildAsset::AllCounted(1)),
                    beneficiary: beneficiary("0xbeef"),
                },
            ]
        );
        assert_eq!(outbound.request.amount(), Some(1_000));
        assert_eq!(outbound.message.fee.as_ref().map(|f| f.amount), Some(10));
        assert!(outbound.message.timeout.height.is_none());
    }

    #[test]
    fn test_route_fee_asset_overrides_default() {
        let mut route = Route::direct("tracepost", "moonbeam");
        route.fee_asset = Some("glmr".into());
        route.fee_amount = Some(42);
        let builder = builder_with(vec![route]);
        builder.assets.register_asset(Asset {
            id: "glmr".into(),
            name: "Glimmer".into(),
            symbol: "GLMR".into(),
            decimals: 18,
            origin_chain: "moonbeam".into(),
            location: json!({ "parents": 1, "interior": { "X2": [{ "Parachain": 2004 }, { "PalletInstance": 10 }] } }),
            metadata_uri: None,
        });

        let outbound = builder
            .build(&message("moonbeam", Payload::transfer("usdc", 5, "0xbeef").unwrap()))
            .unwrap();
        let fee = outbound.message.fee.clone().unwrap();
        assert_eq!(fee.asset, "glmr");
        assert_eq!(fee.amount, 42);
        match &xcm(&outbound).instructions[2] {
            XcmInstruction::BuyExecution { fees, .. } => assert_eq!(fees.fun.amount(), 42),
            other => panic!("unexpected instruction {:?}", other),
        }
    }

    #[test]
    fn test_call_is_single_transact() {
        let builder = builder_with(vec![]);
        let outbound = builder
            .build(&message("moonbeam", Payload::call("0x0a0b", 1_000_000_000).unwrap()))
            .unwrap();
        let request = xcm(&outbound);
        assert_eq!(
            request.instructions,
            vec![XcmInstruction::Transact {
                origin_kind: OriginKind::SovereignAccount,
                require_weight_at_most: 1_000_000_000,
                call: EncodedCall {
                    encoded: "0x0a0b".into()
                },
            }]
        );
        assert_eq!(request.weight, Some(1_000_000_000));
        assert_eq!(outbound.message.weight, Some(1_000_000_000));
        assert_eq!(outbound.request.amount(), None);
    }

    #[test]
    fn test_multi_hop_tags_sub_chain_ids() {
        let mut route = Route::direct("tracepost", "moonbeam");
        route.route_type = RouteType::ViaRelay;
        route.hops = vec![
            RouteHop {
                chain_id: "polkadot".into(),
                para_id: None,
                bridge_contract: None,
            },
            RouteHop {
                chain_id: "moonbeam".into(),
                para_id: Some(2004),
                bridge_contract: None,
            },
        ];
        let builder = builder_with(vec![route]);
        let outbound = builder
            .build(&message("moonbeam", Payload::transfer("usdc", 300, "0xbeef").unwrap()))
            .unwrap();
        let request = xcm(&outbound);
        assert_eq!(request.source_para_id, Some(2025));
        assert_eq!(request.destination_para_id, Some(2004));
    }

    #[test]
    fn test_route_problems_are_rejected() {
        let mut disabled = Route::direct("tracepost", "moonbeam");
        disabled.status = RouteStatus::Disabled;
        let builder = builder_with(vec![disabled]);
        let payload = Payload::transfer("usdc", 1, "0xbeef").unwrap();
        assert!(matches!(
            builder.preflight("tracepost", "moonbeam", &payload, None),
            Err(Error::Configuration(ConfigurationError::RouteDisabled { .. }))
        ));

        let mut broken = Route::direct("tracepost", "moonbeam");
        broken.hops = vec![RouteHop {
            chain_id: "polkadot".into(),
            para_id: None,
            bridge_contract: None,
        }];
        let builder = builder_with(vec![broken]);
        assert!(matches!(
            builder.build(&message("moonbeam", payload.clone())),
            Err(Error::Configuration(ConfigurationError::UnroutableHop { .. }))
        ));

        let builder = builder_with(vec![]);
        assert!(matches!(
            builder.preflight("moonbeam", "tracepost", &payload, None),
            Err(Error::Configuration(ConfigurationError::UnknownChain(_)))
        ));
        assert!(matches!(
            builder.preflight("tracepost", "cosmoshub", &payload, None),
            Err(Error::Configuration(ConfigurationError::WrongProtocol { .. }))
        ));
    }

    #[test]
    fn test_unregistered_asset_is_rejected() {
        let builder = builder_with(vec![]);
        let payload = Payload::transfer("unknown", 1, "0xbeef").unwrap();
        assert!(matches!(
            builder.preflight("tracepost", "moonbeam", &payload, None),
            Err(Error::Configuration(ConfigurationError::UnregisteredAsset(_)))
        ));
    }
}
