//! Hook registry with ordered buckets.
//!
//! Hooks live in per-opcode buckets plus one wildcard bucket. Each
//! bucket is a list of order groups sorted ascending; within a group
//! registration order is preserved. Execution plans merge the wildcard
//! bucket with the opcode bucket by a two-pointer walk, emitting the
//! wildcard group first on equal orders.

use std::collections::HashMap;

use crate::dispatch::hook::{HookCode, HookEntry, HookHandle, HookId};

struct OrderGroup {
    order: i32,
    hooks: Vec<HookEntry>,
}

/// One step of a merged execution plan.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlanItem {
    pub id: HookId,
    pub code: HookCode,
    pub order: i32,
}

/// Registry of all hooks for one dispatch engine.
pub(crate) struct HookTable {
    buckets: HashMap<u16, Vec<OrderGroup>>,
    wildcard: Vec<OrderGroup>,
}

impl HookTable {
    pub fn new() -> Self {
        Self { buckets: HashMap::new(), wildcard: Vec::new() }
    }

    /// Insert an entry into its order group, creating the group at the
    /// sorted position when absent.
    pub fn insert(&mut self, entry: HookEntry) {
        let groups = match entry.code {
            HookCode::Any => &mut self.wildcard,
            HookCode::Opcode(op) => self.buckets.entry(op).or_default(),
        };

        match groups.binary_search_by_key(&entry.order, |g| g.order) {
            Ok(pos) => groups[pos].hooks.push(entry),
            Err(pos) => {
                let order = entry.order;
                groups.insert(pos, OrderGroup { order, hooks: vec![entry] });
            }
        }
    }

    /// Remove the hook a handle refers to. Idempotent; other hooks in
    /// the same order group are untouched.
    pub fn remove(&mut self, handle: &HookHandle) -> bool {
        let groups = match handle.code {
            HookCode::Any => &mut self.wildcard,
            HookCode::Opcode(op) => match self.buckets.get_mut(&op) {
                Some(groups) => groups,
                None => return false,
            },
        };

        let Ok(pos) = groups.binary_search_by_key(&handle.order, |g| g.order) else {
            return false;
        };

        let before = groups[pos].hooks.len();
        groups[pos].hooks.retain(|h| h.id != handle.id);
        let removed = groups[pos].hooks.len() != before;
        if groups[pos].hooks.is_empty() {
            groups.remove(pos);
        }
        removed
    }

    /// Remove every hook owned by a module. Returns how many went.
    pub fn remove_module(&mut self, module: &str) -> usize {
        let mut removed = 0;
        let mut prune = |groups: &mut Vec<OrderGroup>| {
            for group in groups.iter_mut() {
                let before = group.hooks.len();
                group.hooks.retain(|h| h.module != module);
                removed += before - group.hooks.len();
            }
            groups.retain(|g| !g.hooks.is_empty());
        };

        prune(&mut self.wildcard);
        for groups in self.buckets.values_mut() {
            prune(groups);
        }
        self.buckets.retain(|_, groups| !groups.is_empty());
        removed
    }

    /// Merged execution plan for one opcode: wildcard and opcode
    /// buckets interleaved by ascending order, wildcard first on ties.
    pub fn plan(&self, opcode: u16) -> Vec<PlanItem> {
        let empty: &[OrderGroup] = &[];
        let specific = self.buckets.get(&opcode).map_or(empty, |g| g.as_slice());
        let wildcard = self.wildcard.as_slice();

        let mut plan = Vec::new();
        let mut push_group = |group: &OrderGroup| {
            for hook in &group.hooks {
                plan.push(PlanItem { id: hook.id, code: hook.code, order: hook.order });
            }
        };

        let (mut w, mut s) = (0, 0);
        while w < wildcard.len() && s < specific.len() {
            if wildcard[w].order <= specific[s].order {
                push_group(&wildcard[w]);
                w += 1;
            } else {
                push_group(&specific[s]);
                s += 1;
            }
        }
        for group in &wildcard[w..] {
            push_group(group);
        }
        for group in &specific[s..] {
            push_group(group);
        }
        plan
    }

    /// Locate a live entry from a plan item.
    pub fn find_mut(&mut self, code: HookCode, order: i32, id: HookId) -> Option<&mut HookEntry> {
        let groups = match code {
            HookCode::Any => &mut self.wildcard,
            HookCode::Opcode(op) => self.buckets.get_mut(&op)?,
        };
        let pos = groups.binary_search_by_key(&order, |g| g.order).ok()?;
        groups[pos].hooks.iter_mut().find(|h| h.id == id)
    }

    /// Total number of registered hooks.
    pub fn len(&self) -> usize {
        self.wildcard.iter().map(|g| g.hooks.len()).sum::<usize>()
            + self
                .buckets
                .values()
                .flat_map(|groups| groups.iter())
                .map(|g| g.hooks.len())
                .sum::<usize>()
    }

    /// Drop every hook.
    pub fn clear(&mut self) {
        self.buckets.clear();
        self.wildcard.clear();
    }
}
