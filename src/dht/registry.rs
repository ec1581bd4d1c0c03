use std::collections::HashMap;

use rand::Rng as _;

use crate::task::{
    BroadcastTask, FindPeerTask, GetValueTask, HandshakeAgency, HandshakeSource, HandshakeTarget,
    SaveValueTask, SplitPackageTask, Task,
};

/// Every concrete task the DHT runs.
pub(crate) enum AnyTask {
    FindPeer(FindPeerTask),
    GetValue(GetValueTask),
    SaveValue(SaveValueTask),
    Broadcast(BroadcastTask),
    Source(HandshakeSource),
    Agency(HandshakeAgency),
    Target(HandshakeTarget),
    Split(SplitPackageTask),
}

impl AnyTask {
    pub fn as_task(&self) -> &dyn Task {
        match self {
            AnyTask::FindPeer(t) => t,
            AnyTask::GetValue(t) => t,
            AnyTask::SaveValue(t) => t,
            AnyTask::Broadcast(t) => t,
            AnyTask::Source(t) => t,
            AnyTask::Agency(t) => t,
            AnyTask::Target(t) => t,
            AnyTask::Split(t) => t,
        }
    }

    pub fn as_task_mut(&mut self) -> &mut dyn Task {
        match self {
            AnyTask::FindPeer(t) => t,
            AnyTask::GetValue(t) => t,
            AnyTask::SaveValue(t) => t,
            AnyTask::Broadcast(t) => t,
            AnyTask::Source(t) => t,
            AnyTask::Agency(t) => t,
            AnyTask::Target(t) => t,
            AnyTask::Split(t) => t,
        }
    }

    fn relay_key(&self) -> Option<(String, u32)> {
        match self {
            AnyTask::FindPeer(t) => t.relay_key(),
            AnyTask::GetValue(t) => t.relay_key(),
            AnyTask::SaveValue(t) => t.relay_key(),
            _ => None,
        }
    }
}

/// Live tasks plus the secondary indexes used to route requests that carry
/// no correlation id of ours.
#[derive(Default)]
pub(crate) struct TaskRegistry {
    tasks: HashMap<u32, AnyTask>,
    next_id: u32,
    relays: HashMap<(String, u32), u32>,
    broadcasts: HashMap<(String, u32), u32>,
    sources: HashMap<String, u32>,
    agencies: HashMap<(String, String), u32>,
    targets: HashMap<String, u32>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            next_id: rand::rng().random_range(1..u32::MAX / 2),
            ..Default::default()
        }
    }

    /// A fresh, non-zero task id.
    pub fn allocate_id(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.tasks.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn ids(&self) -> Vec<u32> {
        self.tasks.keys().copied().collect()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.tasks.contains_key(&id)
    }

    pub fn get(&self, id: u32) -> Option<&AnyTask> {
        self.tasks.get(&id)
    }

    pub fn insert(&mut self, task: AnyTask) {
        let id = task.as_task().id();
        if let Some(key) = task.relay_key() {
            self.relays.insert(key, id);
        }
        match &task {
            AnyTask::Broadcast(t) => {
                self.broadcasts.insert(t.key(), id);
            }
            AnyTask::Source(t) => {
                self.sources.insert(t.target().to_string(), id);
            }
            AnyTask::Agency(t) => {
                self.agencies.insert(t.key(), id);
            }
            AnyTask::Target(t) => {
                self.targets.insert(t.source().to_string(), id);
            }
            _ => {}
        }
        self.tasks.insert(id, task);
    }

    /// Takes a task out for driving; [`insert`](Self::insert) puts it back.
    pub fn take(&mut self, id: u32) -> Option<AnyTask> {
        let task = self.tasks.remove(&id)?;
        self.unindex(id, &task);
        Some(task)
    }

    fn unindex(&mut self, id: u32, task: &AnyTask) {
        fn drop_if<K: std::hash::Hash + Eq>(map: &mut HashMap<K, u32>, key: &K, id: u32) {
            if map.get(key) == Some(&id) {
                map.remove(key);
            }
        }
        if let Some(key) = task.relay_key() {
            drop_if(&mut self.relays, &key, id);
        }
        match task {
            AnyTask::Broadcast(t) => drop_if(&mut self.broadcasts, &t.key(), id),
            AnyTask::Source(t) => drop_if(&mut self.sources, &t.target().to_string(), id),
            AnyTask::Agency(t) => drop_if(&mut self.agencies, &t.key(), id),
            AnyTask::Target(t) => drop_if(&mut self.targets, &t.source().to_string(), id),
            _ => {}
        }
    }

    pub fn relay(&self, requester: &str, task_id: u32) -> Option<u32> {
        self.relays.get(&(requester.to_string(), task_id)).copied()
    }

    pub fn broadcast(&self, origin: &str, event_id: u32) -> Option<u32> {
        self.broadcasts.get(&(origin.to_string(), event_id)).copied()
    }

    pub fn source(&self, target: &str) -> Option<u32> {
        self.sources.get(target).copied()
    }

    pub fn agency(&self, source: &str, target: &str) -> Option<u32> {
        self.agencies
            .get(&(source.to_string(), target.to_string()))
            .copied()
    }

    pub fn target(&self, source: &str) -> Option<u32> {
        self.targets.get(source).copied()
    }
}
