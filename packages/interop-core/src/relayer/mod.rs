use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::{
    config::{ChainConfig, Config},
    envelope::{EnvelopeBuilder, HeightSource},
    packet::{BuilderContext, DefaultPacketBuilderFactory, Outbound, PacketBuilderFactory},
    registry::{AssetRegistry, ChainDirectory, ChannelRegistry, RouteRegistry, TrustRegistry},
    transport::{HttpTransport, RelayTransport},
    types::{
        Asset, ChainId, Channel, Message, MessageId, MessageStatus, Payload, ProtocolFamily, Route,
        RouteStatus, TrustedChainProfile,
    },
    verify::{remaining, with_deadline, DeliveryRef, RetryPolicy, StatusEngine},
    Error,
};

pub mod ledger;

use ledger::{Claim, MessageLedger};

/// 单次发送的可选参数
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// 指定源通道（仅 IBC）；为空时按目标链查找
    pub channel: Option<String>,
    pub timeout_minutes: Option<u64>,
    /// 构建与提交的总期限
    pub deadline: Option<Duration>,
    pub memo: Option<String>,
}

/// 可持久化的桥状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub channels: Vec<Channel>,
    pub routes: Vec<Route>,
    pub assets: Vec<Asset>,
    pub trusted_chains: Vec<TrustedChainProfile>,
    pub messages: Vec<Outbound>,
    #[serde(default)]
    pub sync_heights: BTreeMap<ChainId, u64>,
}

impl StateSnapshot {
    /// 读取状态文件；文件不存在时返回 None
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>, Error> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read state file {:?}: {}", path, e)))?;
        let snapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::Serialization(format!("Invalid state file {:?}: {}", path, e)))?;
        Ok(Some(snapshot))
    }

    /// 先写临时文件再替换，避免中途失败留下半个状态文件
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let path = path.as_ref();
        let raw = serde_json::to_string_pretty(self).map_err(|e| Error::Serialization(e.to_string()))?;
        let staging = path.with_extension("tmp");
        std::fs::write(&staging, raw)
            .and_then(|_| std::fs::rename(&staging, path))
            .map_err(|e| Error::Config(format!("Failed to write state file {:?}: {}", path, e)))?;
        debug!(path = ?path, messages = self.messages.len(), "State file written");
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub channels: usize,
    pub routes: usize,
    pub assets: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainSummary {
    pub id: ChainId,
    pub protocol: ProtocolFamily,
    pub open_channels: usize,
    pub active_routes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkStatus {
    pub local_chain: ChainId,
    pub chains: Vec<ChainSummary>,
    pub messages: BTreeMap<MessageStatus, usize>,
}

/// 跨链桥门面：组合注册表、信封、包构建器、传输与状态引擎
pub struct Bridge {
    config: Config,
    chains: Arc<ChainDirectory>,
    channels: Arc<ChannelRegistry>,
    routes: Arc<RouteRegistry>,
    assets: Arc<AssetRegistry>,
    trust: Arc<TrustRegistry>,
    transport: Arc<dyn RelayTransport>,
    engine: Arc<StatusEngine>,
    envelopes: EnvelopeBuilder,
    factory: DefaultPacketBuilderFactory,
    ledger: MessageLedger,
    sync_heights: RwLock<HashMap<ChainId, u64>>,
}

impl Bridge {
    pub fn new(config: Config) -> Result<Self, Error> {
        let chains = Arc::new(ChainDirectory::new(config.chains.clone()));
        let transport = Arc::new(HttpTransport::new(chains.clone(), &config.relayer)?);
        Ok(Self::assemble(config, chains, transport))
    }

    /// 使用外部提供的传输（测试或自定义中继）
    pub fn with_transport(config: Config, transport: Arc<dyn RelayTransport>) -> Self {
        let chains = Arc::new(ChainDirectory::new(config.chains.clone()));
        Self::assemble(config, chains, transport)
    }

    fn assemble(config: Config, chains: Arc<ChainDirectory>, transport: Arc<dyn RelayTransport>) -> Self {
        let channels = Arc::new(ChannelRegistry::new());
        for channel in config.channels.iter().cloned() {
            channels.register_channel(channel);
        }
        let routes = Arc::new(RouteRegistry::new());
        for route in config.routes.iter().cloned() {
            routes.register_route(route);
        }
        let assets = Arc::new(AssetRegistry::new());
        for asset in config.assets.iter().cloned() {
            assets.register_asset(asset);
        }
        let trust = Arc::new(TrustRegistry::new());
        for profile in config.trusted_chains.iter().cloned() {
            trust.add_trusted_chain(profile);
        }

        let engine = Arc::new(StatusEngine::with_policy(
            transport.clone(),
            channels.clone(),
            &config.relayer,
            RetryPolicy::from_config(&config.relayer),
        ));
        let heights: Arc<dyn HeightSource> = engine.clone();
        let envelopes = EnvelopeBuilder::new(
            chains.clone(),
            trust.clone(),
            heights,
            config.relayer.timeout_block_margin,
        );
        let factory = DefaultPacketBuilderFactory::new(BuilderContext {
            local: config.local_chain.clone(),
            chains: chains.clone(),
            channels: channels.clone(),
            routes: routes.clone(),
            assets: assets.clone(),
        });

        info!(
            local_chain = %config.local_chain.id,
            chains = config.chains.len(),
            "Bridge initialised"
        );

        Self {
            config,
            chains,
            channels,
            routes,
            assets,
            trust,
            transport,
            engine,
            envelopes,
            factory,
            ledger: MessageLedger::new(),
            sync_heights: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_chain(&self) -> &str {
        &self.config.local_chain.id
    }

    pub async fn send_transfer(
        &self,
        destination: &str,
        asset: &str,
        amount: u128,
        recipient: &str,
    ) -> Result<MessageId, Error> {
        let payload = Payload::transfer(asset, amount, recipient)?;
        self.send(destination, payload, SendOptions::default()).await
    }

    pub async fn send_call(&self, destination: &str, encoded_call: &str, weight: u64) -> Result<MessageId, Error> {
        let payload = Payload::call(encoded_call, weight)?;
        self.send(destination, payload, SendOptions::default()).await
    }

    /// 构建并提交一条消息。
    ///
    /// 构建期的所有检查都在网络调用之前完成。相同负载再次发送得到相同 ID：
    /// 仍是 pending 的消息会被重新提交，其余情况直接返回已有 ID。
    pub async fn send(&self, destination: &str, payload: Payload, options: SendOptions) -> Result<MessageId, Error> {
        let family = self.chains.family(destination)?;
        let builder = self.factory.create_builder(family);
        builder.preflight(
            self.local_chain(),
            destination,
            &payload,
            options.channel.as_deref(),
        )?;

        let timeout_minutes = options
            .timeout_minutes
            .unwrap_or(self.config.relayer.default_timeout_minutes);
        // 构建与提交共用同一个截止时刻
        let deadline = options.deadline.map(|limit| Instant::now() + limit);
        let mut message = with_deadline(
            remaining(deadline)?,
            self.envelopes
                .build_envelope(self.local_chain(), destination, payload, timeout_minutes),
        )
        .await?;

        let id = message.id.clone();
        let outbound = match self.ledger.claim(&id) {
            Claim::Existing(existing) if existing.message.status == MessageStatus::Pending => {
                info!(message_id = %id, "Resubmitting pending message");
                *existing
            }
            Claim::Existing(existing) => {
                debug!(message_id = %id, status = %existing.message.status, "Message already known");
                return Ok(id);
            }
            Claim::InFlight => {
                debug!(message_id = %id, "Message is being built by another caller");
                return Ok(id);
            }
            Claim::Claimed => {
                // 期限已到时不分配序号
                if let Err(e) = remaining(deadline) {
                    self.ledger.release(&id);
                    return Err(e);
                }
                message.source_channel = options.channel.clone();
                message.memo = options.memo.clone();
                match builder.build(&message) {
                    Ok(outbound) => {
                        self.ledger.insert(outbound.clone());
                        outbound
                    }
                    Err(e) => {
                        self.ledger.release(&id);
                        return Err(e);
                    }
                }
            }
        };

        let mut working = outbound;
        let result = match remaining(deadline) {
            Ok(left) => with_deadline(left, self.engine.submit(&mut working)).await,
            Err(e) => Err(e),
        };
        if !matches!(result, Err(Error::DeadlineExceeded)) {
            self.ledger.update(working);
        }
        match result {
            Ok(()) => Ok(id),
            Err(e) => {
                warn!(message_id = %id, error = %e, "Submission did not complete");
                Err(e)
            }
        }
    }

    pub fn get_status(&self, id: &str) -> Result<MessageStatus, Error> {
        self.get_message(id).map(|m| m.status)
    }

    pub fn get_message(&self, id: &str) -> Result<Message, Error> {
        self.outbound(id).map(|o| o.message)
    }

    pub fn list_messages(&self) -> Vec<Message> {
        self.ledger.list().into_iter().map(|o| o.message).collect()
    }

    fn outbound(&self, id: &str) -> Result<Outbound, Error> {
        self.ledger
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("message {}", id)))
    }

    /// 按投递引用查验
    pub async fn verify(&self, source_chain: &str, reference: &DeliveryRef) -> Result<bool, Error> {
        self.engine.verify_delivery(source_chain, reference).await
    }

    /// 查验本桥发出的一条消息
    pub async fn verify_message(&self, id: &str) -> Result<bool, Error> {
        let message = self.get_message(id)?;
        let family = self.chains.family(&message.destination_chain)?;
        let reference = StatusEngine::delivery_ref(&message, family)
            .ok_or_else(|| Error::NotFound(format!("message {} has no packet coordinates", id)))?;
        self.engine.verify_delivery(&message.source_chain, &reference).await
    }

    /// 本地已知的可用路由（不含 disabled）
    pub fn query_routes(&self) -> Vec<Route> {
        self.routes
            .list_routes()
            .into_iter()
            .filter(|r| r.status != RouteStatus::Disabled)
            .collect()
    }

    pub fn list_channels(&self) -> Vec<Channel> {
        self.channels.list_channels()
    }

    pub fn list_assets(&self) -> Vec<Asset> {
        self.assets.list_assets()
    }

    pub fn list_chains(&self) -> Vec<ChainConfig> {
        self.chains.list()
    }

    pub fn register_channel(&self, channel: Channel) -> String {
        self.channels.register_channel(channel)
    }

    pub fn register_route(&self, route: Route) {
        self.routes.register_route(route);
    }

    pub fn register_asset(&self, asset: Asset) {
        self.assets.register_asset(asset);
    }

    pub fn add_trusted_chain(&self, profile: TrustedChainProfile) {
        self.trust.add_trusted_chain(profile);
    }

    pub fn get_trust_level(&self, chain: &str) -> Result<f64, Error> {
        Ok(self.trust.get_trust_level(chain)?)
    }

    /// 重启且未持久化时屏蔽之前可能发出的序号
    pub fn fence_channel(&self, channel: &str, floor: u64) -> Result<u64, Error> {
        self.channels.fence(channel, floor)
    }

    /// 推进一条消息。期限到达时放弃本次轮询，台账不变。
    pub async fn poll(&self, id: &str, deadline: Option<Duration>) -> Result<MessageStatus, Error> {
        let mut working = self.outbound(id)?;
        let result = with_deadline(deadline, self.engine.poll_status(&mut working)).await;
        if matches!(result, Err(Error::DeadlineExceeded)) {
            return result;
        }
        self.commit(working);
        result
    }

    fn commit(&self, outbound: Outbound) {
        let acked = match (&outbound.message.source_channel, outbound.message.sequence) {
            (Some(channel), Some(sequence)) if outbound.message.status == MessageStatus::Acknowledged => {
                Some((channel.clone(), sequence))
            }
            _ => None,
        };
        if self.ledger.update(outbound) {
            if let Some((channel, sequence)) = acked {
                if let Err(e) = self.channels.record_ack(&channel, sequence) {
                    warn!(%channel, sequence, error = %e, "Failed to record acknowledgement");
                }
            }
        }
    }

    /// 轮询所有非终态消息，返回状态发生变化的消息
    pub async fn poll_all(&self) -> Vec<(MessageId, MessageStatus)> {
        let mut changed = Vec::new();
        for id in self.ledger.active() {
            let before = self.get_status(&id).ok();
            match self.poll(&id, None).await {
                Ok(status) if Some(status) != before => changed.push((id, status)),
                Ok(_) => {}
                Err(e) if e.is_retryable() => {
                    debug!(message_id = %id, error = %e, "Poll will be retried next round");
                }
                Err(e) => error!(message_id = %id, error = %e, "Failed to poll message"),
            }
        }
        changed
    }

    /// 手动重试 pending 消息：同一 ID、同一序号、同一线上请求
    pub async fn retry(&self, id: &str) -> Result<MessageStatus, Error> {
        let mut working = self.outbound(id)?;
        if working.message.status != MessageStatus::Pending {
            return Err(Error::InvalidTransition {
                from: working.message.status,
                to: MessageStatus::Submitted,
            });
        }
        let result = self.engine.submit(&mut working).await;
        let status = working.message.status;
        self.commit(working);
        result.map(|_| status)
    }

    /// 带外送达的确认。消息已超时或已终结时丢弃并返回 false。
    pub fn record_acknowledgement(&self, id: &str) -> Result<bool, Error> {
        let mut working = self.outbound(id)?;
        if !working.message.acknowledge()? {
            warn!(
                message_id = %id,
                status = %working.message.status,
                "Discarding late acknowledgement"
            );
            return Ok(false);
        }
        info!(message_id = %id, "Acknowledgement recorded");
        self.commit(working);
        Ok(true)
    }

    /// 从远端回读通道、路由和资产。远端为准：同键记录被覆盖，但通道序号不回退。
    pub async fn sync_registries(&self, chain: &str) -> Result<SyncReport, Error> {
        let family = self.chains.family(chain)?;
        let mut report = SyncReport::default();

        let channels = self.transport.query_channels(chain).await?;
        report.channels = channels.len();
        for channel in channels {
            self.channels.register_channel(channel);
        }

        if family == ProtocolFamily::Xcm {
            let routes = self.transport.query_routes(chain).await?;
            report.routes = routes.len();
            for route in routes {
                self.routes.register_route(route);
            }
        }

        let assets = self.transport.query_assets(chain).await?;
        report.assets = assets.len();
        self.assets.overwrite(assets);

        info!(
            chain,
            channels = report.channels,
            routes = report.routes,
            assets = report.assets,
            "Registries synced from remote"
        );
        Ok(report)
    }

    /// 在目标中继链上登记本平行链
    pub async fn register_parachain(&self, chain: &str, endpoint: &str) -> Result<(), Error> {
        let parachain_id = self.config.local_chain.parachain_id.ok_or_else(|| {
            Error::Config(format!("Local chain {} has no parachain id", self.local_chain()))
        })?;
        self.transport
            .register_parachain(chain, parachain_id, endpoint)
            .await
    }

    /// 同步中继链，返回并记录新的同步高度（只增不减）
    pub async fn sync_relay_chain(&self, chain: &str) -> Result<u64, Error> {
        let parachain_id = self
            .chains
            .get(chain)?
            .parachain_id
            .or(self.config.local_chain.parachain_id)
            .ok_or_else(|| Error::Config(format!("No parachain id known for {}", chain)))?;
        let last = self.sync_heights.read().get(chain).copied().unwrap_or(0);
        let height = self
            .transport
            .sync_relay_chain(chain, parachain_id, last)
            .await?;
        let mut heights = self.sync_heights.write();
        let entry = heights.entry(chain.to_string()).or_insert(0);
        *entry = (*entry).max(height);
        info!(chain, from = last, to = *entry, "Relay chain synced");
        Ok(*entry)
    }

    pub fn network_status(&self) -> NetworkStatus {
        let channels = self.channels.list_channels();
        let routes = self.routes.list_routes();
        let chains = self
            .chains
            .list()
            .into_iter()
            .map(|chain| ChainSummary {
                open_channels: channels
                    .iter()
                    .filter(|c| c.counterparty_chain == chain.id && c.is_open())
                    .count(),
                active_routes: routes
                    .iter()
                    .filter(|r| r.destination_chain == chain.id && r.status != RouteStatus::Disabled)
                    .count(),
                id: chain.id,
                protocol: chain.protocol,
            })
            .collect();
        NetworkStatus {
            local_chain: self.local_chain().to_string(),
            chains,
            messages: self.ledger.counts(),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            channels: self.channels.list_channels(),
            routes: self.routes.list_routes(),
            assets: self.assets.list_assets(),
            trusted_chains: self.trust.list_profiles(),
            messages: self.ledger.list(),
            sync_heights: self
                .sync_heights
                .read()
                .iter()
                .map(|(k, v)| (k.clone(), *v))
                .collect(),
        }
    }

    /// 从状态文件恢复；文件不存在时保持配置中的初始状态
    pub fn load_state<P: AsRef<Path>>(&self, path: P) -> Result<bool, Error> {
        match StateSnapshot::load(path)? {
            Some(snapshot) => {
                self.restore(snapshot)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn save_state<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        self.snapshot().save(path)
    }

    /// 恢复快照，并把每个通道的下一个序号抬过台账中已出现的序号
    pub fn restore(&self, snapshot: StateSnapshot) -> Result<(), Error> {
        for channel in snapshot.channels {
            self.channels.register_channel(channel);
        }
        for route in snapshot.routes {
            self.routes.register_route(route);
        }
        self.assets.overwrite(snapshot.assets);
        for profile in snapshot.trusted_chains {
            self.trust.add_trusted_chain(profile);
        }

        let mut floors: HashMap<String, u64> = HashMap::new();
        for outbound in &snapshot.messages {
            if let (Some(channel), Some(sequence)) =
                (&outbound.message.source_channel, outbound.message.sequence)
            {
                let floor = floors.entry(channel.clone()).or_insert(0);
                *floor = (*floor).max(sequence + 1);
            }
        }
        for (channel, floor) in floors {
            self.channels.fence(&channel, floor)?;
        }

        let restored = snapshot.messages.len();
        self.ledger.restore(snapshot.messages);
        let mut heights = self.sync_heights.write();
        for (chain, height) in snapshot.sync_heights {
            let entry = heights.entry(chain).or_insert(0);
            *entry = (*entry).max(height);
        }
        info!(messages = restored, "State restored from snapshot");
        Ok(())
    }

    /// 中继服务循环：按间隔推进所有在途消息
    pub async fn start(&self) -> Result<(), Error> {
        let interval = Duration::from_secs(self.config.relayer.poll_interval);
        info!(local_chain = %self.local_chain(), ?interval, "Starting relayer loop");
        loop {
            let changed = self.poll_all().await;
            for (id, status) in &changed {
                info!(message_id = %id, %status, "Message status updated");
            }
            sleep(interval).await;
        }
    }
}
