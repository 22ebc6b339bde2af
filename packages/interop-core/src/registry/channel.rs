use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::types::{Channel, ChannelId};
use crate::{ConfigurationError, Error};

/// 单个通道的槽位：元数据可整体替换，序号计数器只做原子操作
struct ChannelSlot {
    meta: RwLock<Channel>,
    next_sequence: AtomicU64,
    last_ack_sequence: AtomicU64,
}

impl ChannelSlot {
    fn new(channel: Channel) -> Self {
        Self {
            next_sequence: AtomicU64::new(channel.next_sequence.max(1)),
            last_ack_sequence: AtomicU64::new(channel.last_ack_sequence),
            meta: RwLock::new(channel),
        }
    }

    fn snapshot(&self) -> Channel {
        let mut channel = self.meta.read().clone();
        channel.next_sequence = self.next_sequence.load(Ordering::SeqCst);
        channel.last_ack_sequence = self.last_ack_sequence.load(Ordering::SeqCst);
        channel
    }
}

/// 通道状态存储
///
/// 外层锁只保护通道表本身；分配序号时只读取表，然后在槽位的原子计数器上
/// fetch_add，因此并发调用者永远不会拿到相同的序号。
#[derive(Default)]
pub struct ChannelRegistry {
    channels: RwLock<HashMap<ChannelId, Arc<ChannelSlot>>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册或更新通道。已存在时替换元数据，但序号计数器只增不减。
    pub fn register_channel(&self, channel: Channel) -> ChannelId {
        let id = channel.channel_id.clone();
        let mut channels = self.channels.write();
        match channels.get(&id) {
            Some(slot) => {
                slot.next_sequence
                    .fetch_max(channel.next_sequence, Ordering::SeqCst);
                slot.last_ack_sequence
                    .fetch_max(channel.last_ack_sequence, Ordering::SeqCst);
                *slot.meta.write() = channel;
                debug!(channel = %id, "Updated channel metadata");
            }
            None => {
                info!(
                    channel = %id,
                    counterparty = %channel.counterparty_chain,
                    next_sequence = channel.next_sequence,
                    "Registered channel"
                );
                channels.insert(id.clone(), Arc::new(ChannelSlot::new(channel)));
            }
        }
        id
    }

    pub fn get_channel(&self, id: &str) -> Result<Channel, Error> {
        self.slot(id).map(|slot| slot.snapshot())
    }

    pub fn list_channels(&self) -> Vec<Channel> {
        let mut channels: Vec<_> = self
            .channels
            .read()
            .values()
            .map(|slot| slot.snapshot())
            .collect();
        channels.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        channels
    }

    /// 原子地读取并递增下一个出站序号
    pub fn next_sequence(&self, id: &str) -> Result<u64, Error> {
        let slot = self.slot(id)?;
        let sequence = slot.next_sequence.fetch_add(1, Ordering::SeqCst);
        debug!(channel = %id, sequence, "Allocated packet sequence");
        Ok(sequence)
    }

    /// 记录确认；只能确认已经发出的序号
    pub fn record_ack(&self, id: &str, sequence: u64) -> Result<(), Error> {
        let slot = self.slot(id)?;
        let issued = slot.next_sequence.load(Ordering::SeqCst);
        if sequence == 0 || sequence >= issued {
            return Err(Error::NotFound(format!(
                "sequence {} was never issued on channel {}",
                sequence, id
            )));
        }
        let previous = slot.last_ack_sequence.fetch_max(sequence, Ordering::SeqCst);
        if previous >= sequence {
            debug!(channel = %id, sequence, previous, "Acknowledgement does not advance channel");
        }
        Ok(())
    }

    /// 重启后未持久化时，把下一个序号至少抬到 floor，屏蔽之前可能发出的序号
    pub fn fence(&self, id: &str, floor: u64) -> Result<u64, Error> {
        let slot = self.slot(id)?;
        let previous = slot.next_sequence.fetch_max(floor, Ordering::SeqCst);
        let current = previous.max(floor);
        if current != previous {
            warn!(channel = %id, from = previous, to = current, "Fenced channel sequence");
        }
        Ok(current)
    }

    /// 找到通往目标链的通道：优先 OPEN 的通道
    pub fn channel_to(&self, chain: &str) -> Result<Channel, ConfigurationError> {
        let candidates: Vec<Channel> = self
            .list_channels()
            .into_iter()
            .filter(|c| c.counterparty_chain == chain)
            .collect();

        if let Some(open) = candidates.iter().find(|c| c.is_open()) {
            return Ok(open.clone());
        }
        match candidates.into_iter().next() {
            Some(channel) => Err(ConfigurationError::ChannelNotOpen {
                channel: channel.channel_id,
                state: channel.state.to_string(),
            }),
            None => Err(ConfigurationError::ChannelNotFound(format!(
                "no channel to {}",
                chain
            ))),
        }
    }

    fn slot(&self, id: &str) -> Result<Arc<ChannelSlot>, Error> {
        self.channels
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| ConfigurationError::ChannelNotFound(id.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChannelState;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::thread;

    fn channel(id: &str, next: u64) -> Channel {
        let mut channel = Channel::new(id, "transfer", "channel-7", "transfer", "cosmoshub");
        channel.next_sequence = next;
        channel
    }

    #[test]
    fn test_sequence_allocation_increments() {
        let registry = ChannelRegistry::new();
        registry.register_channel(channel("ch-1", 5));

        assert_eq!(registry.next_sequence("ch-1").unwrap(), 5);
        assert_eq!(registry.next_sequence("ch-1").unwrap(), 6);
        assert_eq!(registry.get_channel("ch-1").unwrap().next_sequence, 7);
    }

    #[test]
    fn test_unknown_channel() {
        let registry = ChannelRegistry::new();
        assert!(matches!(
            registry.next_sequence("nope"),
            Err(Error::Configuration(ConfigurationError::ChannelNotFound(_)))
        ));
    }

    #[test]
    fn test_two_concurrent_callers_get_five_and_six() {
        let registry = Arc::new(ChannelRegistry::new());
        registry.register_channel(channel("ch-1", 5));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let registry = registry.clone();
                thread::spawn(move || registry.next_sequence("ch-1").unwrap())
            })
            .collect();
        let mut got: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        got.sort_unstable();

        assert_eq!(got, vec![5, 6]);
    }

    #[test]
    fn test_reregistering_never_rewinds_sequence() {
        let registry = ChannelRegistry::new();
        registry.register_channel(channel("ch-1", 10));
        registry.next_sequence("ch-1").unwrap();

        let mut remote = channel("ch-1", 1);
        remote.state = ChannelState::Closed;
        registry.register_channel(remote);

        let current = registry.get_channel("ch-1").unwrap();
        assert_eq!(current.next_sequence, 11);
        assert_eq!(current.state, ChannelState::Closed);
    }

    #[test]
    fn test_fence_only_raises() {
        let registry = ChannelRegistry::new();
        registry.register_channel(channel("ch-1", 10));
        assert_eq!(registry.fence("ch-1", 100).unwrap(), 100);
        assert_eq!(registry.fence("ch-1", 50).unwrap(), 100);
        assert_eq!(registry.next_sequence("ch-1").unwrap(), 100);
    }

    #[test]
    fn test_record_ack() {
        let registry = ChannelRegistry::new();
        registry.register_channel(channel("ch-1", 1));
        let seq = registry.next_sequence("ch-1").unwrap();

        registry.record_ack("ch-1", seq).unwrap();
        assert_eq!(registry.get_channel("ch-1").unwrap().last_ack_sequence, seq);
        assert!(registry.record_ack("ch-1", seq + 1).is_err());
    }

    #[test]
    fn test_channel_to_prefers_open() {
        let registry = ChannelRegistry::new();
        let mut closed = channel("ch-0", 1);
        closed.state = ChannelState::Closed;
        registry.register_channel(closed);
        assert!(matches!(
            registry.channel_to("cosmoshub"),
            Err(ConfigurationError::ChannelNotOpen { .. })
        ));

        registry.register_channel(channel("ch-1", 1));
        assert_eq!(registry.channel_to("cosmoshub").unwrap().channel_id, "ch-1");
        assert!(matches!(
            registry.channel_to("osmosis"),
            Err(ConfigurationError::ChannelNotFound(_))
        ));
    }

    proptest! {
        #[test]
        fn sequences_unique_and_gapless_under_concurrency(
            start in 1u64..1_000_000,
            callers in 2usize..12,
            per_caller in 1usize..64,
        ) {
            let registry = Arc::new(ChannelRegistry::new());
            registry.register_channel(channel("ch-1", start));

            let handles: Vec<_> = (0..callers)
                .map(|_| {
                    let registry = registry.clone();
                    thread::spawn(move || {
                        let mut seen = Vec::with_capacity(per_caller);
                        for _ in 0..per_caller {
                            seen.push(registry.next_sequence("ch-1").unwrap());
                        }
                        seen
                    })
                })
                .collect();

            let mut all = Vec::new();
            for handle in handles {
                let seen = handle.join().unwrap();
                // 每个调用者看到的序号严格递增
                prop_assert!(seen.windows(2).all(|w| w[0] < w[1]));
                all.extend(seen);
            }

            let total = callers * per_caller;
            let unique: HashSet<_> = all.iter().copied().collect();
            prop_assert_eq!(unique.len(), total);
            prop_assert_eq!(*all.iter().min().unwrap(), start);
            prop_assert_eq!(*all.iter().max().unwrap(), start + total as u64 - 1);
        }
    }
}
