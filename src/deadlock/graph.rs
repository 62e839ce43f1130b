// ABOUTME: Wait-for graph built from a lock table snapshot, with cycle search.
// ABOUTME: Tarjan's SCC finds deadlocked groups; BFS extracts one shortest cycle per group.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::lock::table::HoldSnapshot;
use crate::lock::{LockId, Priority};

/// A held lock as seen by the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HeldLock {
    pub lock_id: LockId,
    pub holder: String,
    pub priority: Priority,
    pub acquired_at: DateTime<Utc>,
    pub grant_seq: u64,
}

/// Directed graph where `A -> B` means A waits on a resource B holds.
#[derive(Debug, Default)]
pub(crate) struct WaitForGraph {
    edges: BTreeMap<String, BTreeSet<String>>,
    /// Locks behind each edge, keyed by (waiter, holder).
    blocking: BTreeMap<(String, String), Vec<LockId>>,
    locks: HashMap<LockId, HeldLock>,
    /// Most urgent priority each agent holds or waits with.
    urgency: HashMap<String, Priority>,
}

impl WaitForGraph {
    pub(crate) fn from_snapshot(holds: &[HoldSnapshot]) -> Self {
        let mut graph = Self::default();

        for hold in holds {
            graph.note_urgency(&hold.holder, hold.priority);
            graph.locks.insert(
                hold.lock_id,
                HeldLock {
                    lock_id: hold.lock_id,
                    holder: hold.holder.clone(),
                    priority: hold.priority,
                    acquired_at: hold.acquired_at,
                    grant_seq: hold.grant_seq,
                },
            );

            for (waiter, priority) in &hold.waiters {
                graph.note_urgency(waiter, *priority);
                if *waiter == hold.holder {
                    continue;
                }
                graph
                    .edges
                    .entry(waiter.clone())
                    .or_default()
                    .insert(hold.holder.clone());
                let locks = graph
                    .blocking
                    .entry((waiter.clone(), hold.holder.clone()))
                    .or_default();
                if !locks.contains(&hold.lock_id) {
                    locks.push(hold.lock_id);
                }
            }
        }

        graph
    }

    fn note_urgency(&mut self, agent: &str, priority: Priority) {
        self.urgency
            .entry(agent.to_string())
            .and_modify(|p| *p = (*p).min(priority))
            .or_insert(priority);
    }

    pub(crate) fn urgency(&self, agent: &str) -> Option<Priority> {
        self.urgency.get(agent).copied()
    }

    pub(crate) fn edge_count(&self) -> usize {
        self.edges.values().map(BTreeSet::len).sum()
    }

    /// One shortest cycle per deadlocked group, each starting at the
    /// group's lexicographically smallest agent.
    pub(crate) fn cycles(&self) -> Vec<Vec<String>> {
        let mut cycles: Vec<Vec<String>> = strongly_connected(&self.edges)
            .into_iter()
            .filter(|scc| scc.len() >= 2)
            .filter_map(|scc| self.shortest_cycle(&scc))
            .collect();
        cycles.sort();
        cycles
    }

    /// True if every edge of `cycle` (including last -> first) exists.
    pub(crate) fn has_cycle(&self, cycle: &[String]) -> bool {
        if cycle.len() < 2 {
            return false;
        }
        cycle_edges(cycle).all(|(from, to)| {
            self.edges
                .get(from)
                .is_some_and(|targets| targets.contains(to))
        })
    }

    /// Held locks sitting on the edges of `cycle`, in cycle order.
    pub(crate) fn locks_on_cycle(&self, cycle: &[String]) -> Vec<HeldLock> {
        let mut seen = HashSet::new();
        let mut locks = Vec::new();
        for (from, to) in cycle_edges(cycle) {
            let key = (from.clone(), to.clone());
            for lock_id in self.blocking.get(&key).into_iter().flatten() {
                if seen.insert(*lock_id) {
                    if let Some(lock) = self.locks.get(lock_id) {
                        locks.push(lock.clone());
                    }
                }
            }
        }
        locks
    }

    fn shortest_cycle(&self, scc: &[&str]) -> Option<Vec<String>> {
        let members: HashSet<&str> = scc.iter().copied().collect();
        let start = *scc.iter().min()?;

        let mut parent: HashMap<&str, &str> = HashMap::new();
        let mut queue = VecDeque::from([start]);
        while let Some(node) = queue.pop_front() {
            for next in self.edges.get(node).into_iter().flatten() {
                let next = next.as_str();
                if !members.contains(next) {
                    continue;
                }
                if next == start {
                    let mut path = vec![node.to_string()];
                    let mut current = node;
                    while current != start {
                        current = *parent.get(current)?;
                        path.push(current.to_string());
                    }
                    path.reverse();
                    return Some(path);
                }
                if !parent.contains_key(next) {
                    parent.insert(next, node);
                    queue.push_back(next);
                }
            }
        }
        None
    }
}

/// Rotate a cycle so it starts at its smallest agent.
pub(crate) fn canonical(cycle: &[String]) -> Vec<String> {
    let Some(start) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    else {
        return Vec::new();
    };
    cycle[start..]
        .iter()
        .chain(cycle[..start].iter())
        .cloned()
        .collect()
}

fn cycle_edges(cycle: &[String]) -> impl Iterator<Item = (&String, &String)> {
    cycle
        .iter()
        .zip(cycle.iter().cycle().skip(1))
        .take(cycle.len())
}

/// Tarjan's strongly connected components.
fn strongly_connected(edges: &BTreeMap<String, BTreeSet<String>>) -> Vec<Vec<&str>> {
    struct Tarjan<'a> {
        edges: &'a BTreeMap<String, BTreeSet<String>>,
        next_index: usize,
        index: HashMap<&'a str, usize>,
        lowlink: HashMap<&'a str, usize>,
        stack: Vec<&'a str>,
        on_stack: HashSet<&'a str>,
        components: Vec<Vec<&'a str>>,
    }

    impl<'a> Tarjan<'a> {
        fn visit(&mut self, node: &'a str) {
            self.index.insert(node, self.next_index);
            self.lowlink.insert(node, self.next_index);
            self.next_index += 1;
            self.stack.push(node);
            self.on_stack.insert(node);

            let edges = self.edges;
            for next in edges.get(node).into_iter().flatten() {
                let next = next.as_str();
                if !self.index.contains_key(next) {
                    self.visit(next);
                    let low = self.lowlink[node].min(self.lowlink[next]);
                    self.lowlink.insert(node, low);
                } else if self.on_stack.contains(next) {
                    let low = self.lowlink[node].min(self.index[next]);
                    self.lowlink.insert(node, low);
                }
            }

            if self.lowlink[node] == self.index[node] {
                let mut component = Vec::new();
                while let Some(member) = self.stack.pop() {
                    self.on_stack.remove(member);
                    component.push(member);
                    if member == node {
                        break;
                    }
                }
                self.components.push(component);
            }
        }
    }

    let mut tarjan = Tarjan {
        edges,
        next_index: 0,
        index: HashMap::new(),
        lowlink: HashMap::new(),
        stack: Vec::new(),
        on_stack: HashSet::new(),
        components: Vec::new(),
    };
    for node in edges.keys() {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node.as_str());
        }
    }
    tarjan.components
}
