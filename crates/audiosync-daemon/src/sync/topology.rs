// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Routing graph snapshots and the diff between them.
//!
//! The routing head's monitor fans out to one loopback edge per device. Actual
//! topologies may contain several edges for one key; the diff always reduces
//! them to at most one.

use crate::sync::classify::DeviceKey;
use std::collections::{BTreeMap, BTreeSet};

/// A loopback from the routing source to one device sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    pub key: DeviceKey,
    pub source: String,
    pub sink: String,
    pub delay_ms: u32,
    /// Server module index; `None` on desired edges.
    pub module_id: Option<u32>,
}

impl Edge {
    pub fn desired(key: DeviceKey, source: &str, sink: &str, delay_ms: u32) -> Self {
        Self {
            key,
            source: source.to_string(),
            sink: sink.to_string(),
            delay_ms,
            module_id: None,
        }
    }

    fn matches(&self, other: &Edge) -> bool {
        self.key == other.key
            && self.source == other.source
            && self.sink == other.sink
            && self.delay_ms == other.delay_ms
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Topology {
    pub master_present: bool,
    /// Whether the routing head is the server's default sink.
    pub head_is_default: bool,
    pub edges: Vec<Edge>,
    /// Keys whose existing edges are left untouched (absent devices within the
    /// grace window). Only meaningful on a desired topology.
    pub retained: BTreeSet<DeviceKey>,
}

impl Topology {
    pub fn edges_for<'a>(&'a self, key: &'a DeviceKey) -> impl Iterator<Item = &'a Edge> + 'a {
        self.edges.iter().filter(move |e| &e.key == key)
    }

    /// Edges grouped by key, in module order.
    fn by_key(&self) -> BTreeMap<&DeviceKey, Vec<&Edge>> {
        let mut map: BTreeMap<&DeviceKey, Vec<&Edge>> = BTreeMap::new();
        for edge in &self.edges {
            map.entry(&edge.key).or_default().push(edge);
        }
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Removal {
    pub key: DeviceKey,
    pub module_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Creation {
    pub key: DeviceKey,
    pub source: String,
    pub sink: String,
    pub delay_ms: u32,
}

/// Replace an edge whose parameters changed. Loopback latency is fixed at
/// load time, so this is always remove-then-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Update {
    pub key: DeviceKey,
    pub old_module: u32,
    pub old_delay_ms: u32,
    pub source: String,
    pub sink: String,
    pub delay_ms: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyDiff {
    pub create_master: bool,
    pub restore_default: bool,
    pub remove: Vec<Removal>,
    pub create: Vec<Creation>,
    pub update: Vec<Update>,
}

/// Which device keys a pass may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scope {
    All,
    Keys(BTreeSet<DeviceKey>),
}

impl Scope {
    pub fn includes(&self, key: &DeviceKey) -> bool {
        match self {
            Scope::All => true,
            Scope::Keys(keys) => keys.contains(key),
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Scope::All)
    }
}

/// One step of an ordered apply plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedOp {
    CreateMaster,
    RestoreDefault,
    RemoveEdge {
        key: DeviceKey,
        module_id: u32,
    },
    CreateEdge {
        key: DeviceKey,
        source: String,
        sink: String,
        delay_ms: u32,
    },
}

impl PlannedOp {
    pub fn key(&self) -> Option<&DeviceKey> {
        match self {
            PlannedOp::RemoveEdge { key, .. } | PlannedOp::CreateEdge { key, .. } => Some(key),
            _ => None,
        }
    }
}

/// Compute the operations that turn `actual` into `desired`.
pub fn diff(desired: &Topology, actual: &Topology) -> TopologyDiff {
    let mut out = TopologyDiff {
        create_master: desired.master_present && !actual.master_present,
        restore_default: desired.head_is_default
            && (!actual.master_present || !actual.head_is_default),
        ..Default::default()
    };

    let mut actual_by_key = actual.by_key();

    for want in &desired.edges {
        let have = actual_by_key.remove(&want.key).unwrap_or_default();
        let keep = have.iter().position(|e| e.matches(want));

        match keep {
            Some(idx) => {
                for (i, extra) in have.iter().enumerate() {
                    if i != idx {
                        push_removal(&mut out.remove, extra);
                    }
                }
            }
            None => match have.split_first() {
                Some((old, extras)) => {
                    if let Some(old_module) = old.module_id {
                        out.update.push(Update {
                            key: want.key.clone(),
                            old_module,
                            old_delay_ms: old.delay_ms,
                            source: want.source.clone(),
                            sink: want.sink.clone(),
                            delay_ms: want.delay_ms,
                        });
                    } else {
                        out.create.push(creation(want));
                    }
                    for extra in extras {
                        push_removal(&mut out.remove, extra);
                    }
                }
                None => out.create.push(creation(want)),
            },
        }
    }

    // Whatever is left is not desired.
    for (key, edges) in actual_by_key {
        let skip = if desired.retained.contains(key) { 1 } else { 0 };
        for extra in edges.iter().skip(skip) {
            push_removal(&mut out.remove, extra);
        }
    }

    out
}

fn creation(edge: &Edge) -> Creation {
    Creation {
        key: edge.key.clone(),
        source: edge.source.clone(),
        sink: edge.sink.clone(),
        delay_ms: edge.delay_ms,
    }
}

fn push_removal(removals: &mut Vec<Removal>, edge: &Edge) {
    if let Some(module_id) = edge.module_id {
        removals.push(Removal {
            key: edge.key.clone(),
            module_id,
        });
    }
}

impl TopologyDiff {
    pub fn is_empty(&self) -> bool {
        !self.create_master
            && !self.restore_default
            && self.remove.is_empty()
            && self.create.is_empty()
            && self.update.is_empty()
    }

    /// Whether any edge operation falls inside `scope`.
    pub fn touches(&self, scope: &Scope) -> bool {
        self.create_master
            || self.restore_default
            || self.remove.iter().any(|r| scope.includes(&r.key))
            || self.create.iter().any(|c| scope.includes(&c.key))
            || self.update.iter().any(|u| scope.includes(&u.key))
    }

    /// Keys with any pending edge operation.
    pub fn keys(&self) -> BTreeSet<DeviceKey> {
        self.remove
            .iter()
            .map(|r| r.key.clone())
            .chain(self.create.iter().map(|c| c.key.clone()))
            .chain(self.update.iter().map(|u| u.key.clone()))
            .collect()
    }

    /// Ordered operations: master first, then per key every removal before
    /// any creation on that key.
    pub fn plan(&self, scope: &Scope) -> Vec<PlannedOp> {
        let mut ops = Vec::new();
        if self.create_master {
            ops.push(PlannedOp::CreateMaster);
        }
        if self.restore_default {
            ops.push(PlannedOp::RestoreDefault);
        }

        for key in self.keys().into_iter().filter(|k| scope.includes(k)) {
            for r in self.remove.iter().filter(|r| r.key == key) {
                ops.push(PlannedOp::RemoveEdge {
                    key: key.clone(),
                    module_id: r.module_id,
                });
            }
            for u in self.update.iter().filter(|u| u.key == key) {
                ops.push(PlannedOp::RemoveEdge {
                    key: key.clone(),
                    module_id: u.old_module,
                });
            }
            for u in self.update.iter().filter(|u| u.key == key) {
                ops.push(PlannedOp::CreateEdge {
                    key: key.clone(),
                    source: u.source.clone(),
                    sink: u.sink.clone(),
                    delay_ms: u.delay_ms,
                });
            }
            for c in self.create.iter().filter(|c| c.key == key) {
                ops.push(PlannedOp::CreateEdge {
                    key: key.clone(),
                    source: c.source.clone(),
                    sink: c.sink.clone(),
                    delay_ms: c.delay_ms,
                });
            }
        }
        ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "audio_master.monitor";

    fn key(s: &str) -> DeviceKey {
        DeviceKey::new(s)
    }

    fn actual_edge(k: &str, sink: &str, delay: u32, module: u32) -> Edge {
        Edge {
            module_id: Some(module),
            ..Edge::desired(key(k), SRC, sink, delay)
        }
    }

    fn desired(edges: Vec<Edge>) -> Topology {
        Topology {
            master_present: true,
            head_is_default: true,
            edges,
            retained: BTreeSet::new(),
        }
    }

    fn actual(edges: Vec<Edge>) -> Topology {
        Topology {
            master_present: true,
            head_is_default: true,
            edges,
            retained: BTreeSet::new(),
        }
    }

    #[test]
    fn test_empty_actual_creates_everything() {
        let want = desired(vec![
            Edge::desired(key("alsa:a"), SRC, "alsa_output.a", 121),
            Edge::desired(key("bt:b"), SRC, "bluez_output.b", 1),
        ]);
        let d = diff(&want, &Topology::default());
        assert!(d.create_master);
        assert!(d.restore_default);
        assert_eq!(d.create.len(), 2);
        assert!(d.remove.is_empty());

        let plan = d.plan(&Scope::All);
        assert_eq!(plan[0], PlannedOp::CreateMaster);
        assert_eq!(plan[1], PlannedOp::RestoreDefault);
        assert_eq!(plan.len(), 4);
    }

    #[test]
    fn test_matching_topology_is_empty() {
        let want = desired(vec![Edge::desired(key("bt:b"), SRC, "bluez_output.b", 1)]);
        let have = actual(vec![actual_edge("bt:b", "bluez_output.b", 1, 40)]);
        assert!(diff(&want, &have).is_empty());
    }

    #[test]
    fn test_delay_change_is_remove_then_create() {
        let want = desired(vec![Edge::desired(key("alsa:a"), SRC, "alsa_output.a", 140)]);
        let have = actual(vec![actual_edge("alsa:a", "alsa_output.a", 121, 7)]);
        let d = diff(&want, &have);
        assert_eq!(d.update.len(), 1);
        assert_eq!(d.update[0].old_delay_ms, 121);

        let plan = d.plan(&Scope::All);
        assert_eq!(
            plan,
            vec![
                PlannedOp::RemoveEdge {
                    key: key("alsa:a"),
                    module_id: 7
                },
                PlannedOp::CreateEdge {
                    key: key("alsa:a"),
                    source: SRC.to_string(),
                    sink: "alsa_output.a".to_string(),
                    delay_ms: 140
                },
            ]
        );
    }

    #[test]
    fn test_duplicates_reduced_to_one() {
        let want = desired(vec![Edge::desired(key("bt:b"), SRC, "bluez_output.b", 1)]);
        let have = actual(vec![
            actual_edge("bt:b", "bluez_output.b", 5, 10),
            actual_edge("bt:b", "bluez_output.b", 1, 11),
            actual_edge("bt:b", "bluez_output.b", 1, 12),
        ]);
        let d = diff(&want, &have);
        assert!(d.create.is_empty());
        assert!(d.update.is_empty());
        let removed: Vec<u32> = d.remove.iter().map(|r| r.module_id).collect();
        assert_eq!(removed, vec![10, 12]);
    }

    #[test]
    fn test_source_change_rebuilds_edge() {
        let want = desired(vec![Edge::desired(key("bt:b"), "eq_sink.monitor", "bluez_output.b", 1)]);
        let have = actual(vec![actual_edge("bt:b", "bluez_output.b", 1, 3)]);
        let d = diff(&want, &have);
        assert_eq!(d.update.len(), 1);
        assert_eq!(d.update[0].source, "eq_sink.monitor");
    }

    #[test]
    fn test_undesired_edges_removed_unless_retained() {
        let mut want = desired(vec![]);
        let have = actual(vec![
            actual_edge("bt:gone", "bluez_output.gone", 1, 20),
            actual_edge("bt:away", "bluez_output.away", 1, 21),
            actual_edge("bt:away", "bluez_output.away", 1, 22),
        ]);
        want.retained.insert(key("bt:away"));
        let d = diff(&want, &have);
        let removed: Vec<u32> = d.remove.iter().map(|r| r.module_id).collect();
        assert_eq!(removed, vec![22, 20]);
    }

    #[test]
    fn test_scope_filters_edges_not_master() {
        let want = desired(vec![
            Edge::desired(key("alsa:a"), SRC, "alsa_output.a", 121),
            Edge::desired(key("bt:b"), SRC, "bluez_output.b", 1),
        ]);
        let have = Topology::default();
        let d = diff(&want, &have);
        let scope = Scope::Keys([key("bt:b")].into_iter().collect());
        let plan = d.plan(&scope);
        assert_eq!(plan.len(), 3);
        assert!(plan.iter().all(|op| op.key().map_or(true, |k| k == &key("bt:b"))));
        assert!(d.touches(&scope));
    }

    #[test]
    fn test_default_restored_when_not_default() {
        let want = desired(vec![]);
        let mut have = actual(vec![]);
        have.head_is_default = false;
        let d = diff(&want, &have);
        assert!(!d.create_master);
        assert!(d.restore_default);
    }
}
