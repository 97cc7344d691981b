//! Agreements: named sets of plugins and tasks replicated to their
//! member nodes. Every entry is a last-writer-wins register stamped with
//! the originating node's Lamport clock; ties break on node name, so
//! application order never matters and replicas converge.

use oxtel_common::types::{PluginId, TaskManifest};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// An LWW register. `value: None` is a tombstone for a removed entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub clock: u64,
    pub origin: String,
    pub value: Option<T>,
}

impl<T> Stamped<T> {
    pub fn wins_over(&self, other: &Self) -> bool {
        (self.clock, self.origin.as_str()) > (other.clock, other.origin.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginEntry {
    pub id: PluginId,
    /// Control-plane address of the node holding the artifact.
    pub origin_rest: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEntry {
    pub manifest: TaskManifest,
    pub started: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Agreement {
    pub name: String,
    /// member name -> joined register (tombstone = left)
    pub members: BTreeMap<String, Stamped<bool>>,
    pub plugins: BTreeMap<String, Stamped<PluginEntry>>,
    pub tasks: BTreeMap<Uuid, Stamped<TaskEntry>>,
}

impl Agreement {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn is_member(&self, node: &str) -> bool {
        self.members
            .get(node)
            .and_then(|s| s.value)
            .unwrap_or(false)
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|(_, s)| s.value == Some(true))
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn plugin_entries(&self) -> Vec<PluginEntry> {
        self.plugins.iter().filter_map(|(_, s)| s.value.clone()).collect()
    }

    pub fn task_entries(&self) -> Vec<(Uuid, TaskEntry)> {
        self.tasks
            .iter()
            .filter_map(|(id, s)| s.value.clone().map(|v| (*id, v)))
            .collect()
    }
}

pub fn plugin_key(id: &PluginId) -> String {
    format!("{}:{}:{}", id.plugin_type, id.name, id.version)
}

/// A replicated change, totally ordered per originating node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub agreement: String,
    pub origin: String,
    pub clock: u64,
    pub change: Change,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "kebab-case")]
pub enum Change {
    PluginAdded {
        id: PluginId,
        origin_rest: Option<String>,
    },
    PluginRemoved {
        id: PluginId,
    },
    TaskAdded {
        id: Uuid,
        manifest: TaskManifest,
        started: bool,
    },
    TaskRemoved {
        id: Uuid,
    },
    TaskStarted {
        id: Uuid,
    },
    TaskStopped {
        id: Uuid,
    },
    MemberJoined {
        name: String,
    },
    MemberLeft {
        name: String,
    },
}

/// The local side effect an applied delta asks for.
#[derive(Debug, Clone)]
pub enum SideEffect {
    LoadPlugin {
        id: PluginId,
        origin_rest: Option<String>,
    },
    UnloadPlugin {
        id: PluginId,
    },
    CreateTask {
        id: Uuid,
        manifest: TaskManifest,
        started: bool,
    },
    StartTask {
        id: Uuid,
    },
    StopTask {
        id: Uuid,
    },
    RemoveTask {
        id: Uuid,
    },
}

impl SideEffect {
    /// The key used to suppress the echo a side effect produces on the
    /// local event bus.
    pub fn suppression_key(&self) -> String {
        match self {
            SideEffect::LoadPlugin { id, .. } | SideEffect::UnloadPlugin { id } => {
                format!("plugin:{}", plugin_key(id))
            }
            SideEffect::CreateTask { id, .. }
            | SideEffect::StartTask { id }
            | SideEffect::StopTask { id }
            | SideEffect::RemoveTask { id } => format!("task:{id}"),
        }
    }
}

/// The replicated agreement store.
#[derive(Default)]
pub struct AgreementState {
    agreements: BTreeMap<String, Agreement>,
}

impl AgreementState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Agreement> {
        self.agreements.get(name)
    }

    pub fn all(&self) -> &BTreeMap<String, Agreement> {
        &self.agreements
    }

    pub fn snapshot(&self) -> BTreeMap<String, Agreement> {
        self.agreements.clone()
    }

    pub fn insert(&mut self, agreement: Agreement) -> bool {
        if self.agreements.contains_key(&agreement.name) {
            return false;
        }
        self.agreements.insert(agreement.name.clone(), agreement);
        true
    }

    pub fn remove(&mut self, name: &str) -> Option<Agreement> {
        self.agreements.remove(name)
    }

    /// Apply a delta. Returns the local side effect to run when the delta
    /// changed our view and `local_node` is a member of the agreement.
    pub fn apply(&mut self, delta: &Delta, local_node: &str) -> Option<SideEffect> {
        let agreement = self
            .agreements
            .entry(delta.agreement.clone())
            .or_insert_with(|| Agreement::new(&delta.agreement));

        let changed = match &delta.change {
            Change::PluginAdded { id, origin_rest } => set_register(
                &mut agreement.plugins,
                plugin_key(id),
                delta,
                Some(PluginEntry {
                    id: id.clone(),
                    origin_rest: origin_rest.clone(),
                }),
            ),
            Change::PluginRemoved { id } => {
                set_register(&mut agreement.plugins, plugin_key(id), delta, None)
            }
            Change::TaskAdded {
                id,
                manifest,
                started,
            } => set_register(
                &mut agreement.tasks,
                *id,
                delta,
                Some(TaskEntry {
                    manifest: manifest.clone(),
                    started: *started,
                }),
            ),
            Change::TaskRemoved { id } => set_register(&mut agreement.tasks, *id, delta, None),
            Change::TaskStarted { id } | Change::TaskStopped { id } => {
                let started = matches!(delta.change, Change::TaskStarted { .. });
                match agreement.tasks.get(id) {
                    Some(existing) if existing.value.is_some() => {
                        let mut entry = existing.value.clone();
                        if let Some(task) = entry.as_mut() {
                            task.started = started;
                        }
                        set_register(&mut agreement.tasks, *id, delta, entry)
                    }
                    // start/stop for a task we have not seen yet; the
                    // manifest arrives via anti-entropy
                    _ => false,
                }
            }
            Change::MemberJoined { name } => {
                set_register(&mut agreement.members, name.clone(), delta, Some(true))
            }
            Change::MemberLeft { name } => {
                set_register(&mut agreement.members, name.clone(), delta, None)
            }
        };

        if !changed || delta.origin == local_node || !agreement.is_member(local_node) {
            return None;
        }

        match &delta.change {
            Change::PluginAdded { id, origin_rest } => Some(SideEffect::LoadPlugin {
                id: id.clone(),
                origin_rest: origin_rest.clone(),
            }),
            Change::PluginRemoved { id } => Some(SideEffect::UnloadPlugin { id: id.clone() }),
            Change::TaskAdded {
                id,
                manifest,
                started,
            } => Some(SideEffect::CreateTask {
                id: *id,
                manifest: manifest.clone(),
                started: *started,
            }),
            Change::TaskRemoved { id } => Some(SideEffect::RemoveTask { id: *id }),
            Change::TaskStarted { id } => Some(SideEffect::StartTask { id: *id }),
            Change::TaskStopped { id } => Some(SideEffect::StopTask { id: *id }),
            Change::MemberJoined { .. } | Change::MemberLeft { .. } => None,
        }
    }

    /// Anti-entropy merge of a peer's full state. Returns the side
    /// effects for entries the peer knew and we did not.
    pub fn merge(
        &mut self,
        remote: BTreeMap<String, Agreement>,
        local_node: &str,
    ) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        for (name, remote_agreement) in remote {
            let local = self
                .agreements
                .entry(name.clone())
                .or_insert_with(|| Agreement::new(&name));

            for (key, stamped) in remote_agreement.members {
                merge_register(&mut local.members, key, stamped);
            }

            let member_here = local.is_member(local_node);

            for (key, stamped) in remote_agreement.plugins {
                let previous = local.plugins.get(&key).and_then(|s| s.value.clone());
                if merge_register(&mut local.plugins, key, stamped.clone()) && member_here {
                    match stamped.value {
                        Some(entry) => effects.push(SideEffect::LoadPlugin {
                            id: entry.id,
                            origin_rest: entry.origin_rest,
                        }),
                        // tombstone won: the plugin is gone upstream
                        None => {
                            if let Some(previous) = previous {
                                effects.push(SideEffect::UnloadPlugin { id: previous.id });
                            }
                        }
                    }
                }
            }

            for (id, stamped) in remote_agreement.tasks {
                if merge_register(&mut local.tasks, id, stamped.clone()) && member_here {
                    match stamped.value {
                        Some(entry) => effects.push(SideEffect::CreateTask {
                            id,
                            manifest: entry.manifest,
                            started: entry.started,
                        }),
                        None => effects.push(SideEffect::RemoveTask { id }),
                    }
                }
            }
        }
        effects
    }

    /// Tombstone every entry contributed by a node whose failure grace
    /// expired. Returns the local cleanup side effects.
    pub fn gc_failed_member(&mut self, node: &str, clock: u64, by: &str) -> Vec<SideEffect> {
        let mut effects = Vec::new();
        for agreement in self.agreements.values_mut() {
            let plugin_keys: Vec<String> = agreement
                .plugins
                .iter()
                .filter(|(_, s)| s.origin == node && s.value.is_some())
                .map(|(k, _)| k.clone())
                .collect();
            for key in plugin_keys {
                if let Some(entry) = agreement.plugins.get(&key).and_then(|s| s.value.clone()) {
                    effects.push(SideEffect::UnloadPlugin { id: entry.id });
                }
                agreement.plugins.insert(
                    key,
                    Stamped {
                        clock,
                        origin: by.to_string(),
                        value: None,
                    },
                );
            }

            let task_ids: Vec<Uuid> = agreement
                .tasks
                .iter()
                .filter(|(_, s)| s.origin == node && s.value.is_some())
                .map(|(id, _)| *id)
                .collect();
            for id in task_ids {
                effects.push(SideEffect::RemoveTask { id });
                agreement.tasks.insert(
                    id,
                    Stamped {
                        clock,
                        origin: by.to_string(),
                        value: None,
                    },
                );
            }

            agreement.members.insert(
                node.to_string(),
                Stamped {
                    clock,
                    origin: by.to_string(),
                    value: None,
                },
            );
        }
        effects
    }
}

fn set_register<K: Ord, T: Clone + PartialEq>(
    map: &mut BTreeMap<K, Stamped<T>>,
    key: K,
    delta: &Delta,
    value: Option<T>,
) -> bool {
    let incoming = Stamped {
        clock: delta.clock,
        origin: delta.origin.clone(),
        value,
    };
    merge_register(map, key, incoming)
}

/// Insert an incoming register if it wins. Returns whether the visible
/// value changed.
fn merge_register<K: Ord, T: Clone + PartialEq>(
    map: &mut BTreeMap<K, Stamped<T>>,
    key: K,
    incoming: Stamped<T>,
) -> bool {
    use std::collections::btree_map::Entry;
    match map.entry(key) {
        Entry::Vacant(slot) => {
            let visible = incoming.value.is_some();
            slot.insert(incoming);
            visible
        }
        Entry::Occupied(mut slot) => {
            if incoming.wins_over(slot.get()) {
                let changed = slot.get().value != incoming.value;
                *slot.get_mut() = incoming;
                changed
            } else {
                false
            }
        }
    }
}
