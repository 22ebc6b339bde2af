use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, warn};

use crate::packet::Outbound;
use crate::types::{MessageId, MessageStatus};

enum Entry {
    /// 已占位、正在构建；防止同一消息 ID 并发构建两次
    Building,
    Ready(Box<Outbound>),
}

pub enum Claim {
    Claimed,
    Existing(Box<Outbound>),
    InFlight,
}

/// 消息台账：保存每条消息及其线上请求，终态消息保留用于审计
#[derive(Default)]
pub struct MessageLedger {
    entries: RwLock<HashMap<MessageId, Entry>>,
}

impl MessageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&self, id: &str) -> Claim {
        let mut entries = self.entries.write();
        match entries.get(id) {
            Some(Entry::Ready(outbound)) => Claim::Existing(outbound.clone()),
            Some(Entry::Building) => Claim::InFlight,
            None => {
                entries.insert(id.to_string(), Entry::Building);
                Claim::Claimed
            }
        }
    }

    /// 构建失败时释放占位
    pub fn release(&self, id: &str) {
        let mut entries = self.entries.write();
        if matches!(entries.get(id), Some(Entry::Building)) {
            entries.remove(id);
        }
    }

    pub fn insert(&self, outbound: Outbound) {
        self.entries
            .write()
            .insert(outbound.message.id.clone(), Entry::Ready(Box::new(outbound)));
    }

    pub fn get(&self, id: &str) -> Option<Outbound> {
        match self.entries.read().get(id) {
            Some(Entry::Ready(outbound)) => Some((**outbound).clone()),
            _ => None,
        }
    }

    /// 写回轮询结果。终态记录不再改变，非法迁移被忽略；返回是否写入。
    pub fn update(&self, outbound: Outbound) -> bool {
        let mut entries = self.entries.write();
        let Some(Entry::Ready(current)) = entries.get_mut(&outbound.message.id) else {
            warn!(message_id = %outbound.message.id, "Update for unknown message ignored");
            return false;
        };
        let from = current.message.status;
        let to = outbound.message.status;
        if from.is_terminal() && from != to {
            warn!(message_id = %outbound.message.id, %from, %to, "Message already terminal, update discarded");
            return false;
        }
        if from != to && !from.can_transition_to(to) {
            warn!(message_id = %outbound.message.id, %from, %to, "Stale update discarded");
            return false;
        }
        if from != to {
            debug!(message_id = %outbound.message.id, %from, %to, "Message status changed");
        }
        **current = outbound;
        true
    }

    pub fn list(&self) -> Vec<Outbound> {
        let mut messages: Vec<Outbound> = self
            .entries
            .read()
            .values()
            .filter_map(|entry| match entry {
                Entry::Ready(outbound) => Some((**outbound).clone()),
                Entry::Building => None,
            })
            .collect();
        messages.sort_by(|a, b| {
            a.message
                .created_at
                .cmp(&b.message.created_at)
                .then_with(|| a.message.id.cmp(&b.message.id))
        });
        messages
    }

    /// 非终态消息的 ID
    pub fn active(&self) -> Vec<MessageId> {
        self.list()
            .into_iter()
            .filter(|o| !o.message.status.is_terminal())
            .map(|o| o.message.id)
            .collect()
    }

    pub fn counts(&self) -> BTreeMap<MessageStatus, usize> {
        let mut counts = BTreeMap::new();
        for outbound in self.list() {
            *counts.entry(outbound.message.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn restore(&self, messages: Vec<Outbound>) {
        let mut entries = self.entries.write();
        for outbound in messages {
            entries.insert(outbound.message.id.clone(), Entry::Ready(Box::new(outbound)));
        }
    }
}
