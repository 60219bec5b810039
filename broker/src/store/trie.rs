// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Subscription trie: filters are inserted level-by-level, the same shape
//! as [`crate::store::retained::RetainedStore`] but with subscribers at
//! the leaves instead of a single retained message, and an incoming topic
//! name is matched by walking the name's levels against literal, `+` and
//! `#` children. Shared subscriptions (`$share/<group>/<filter>`) are kept
//! in a side table per node so a matching publish picks exactly one member
//! per group instead of fanning out to all of them.

use std::collections::HashMap;

use embermq_codec::header::QoS;
use embermq_codec::topic::{is_system_topic, parse_filter};

#[derive(Debug, Clone)]
pub struct Subscriber {
    pub client_id: String,
    pub qos: QoS,
    pub no_local: bool,
    pub retain_as_published: bool,
    pub subscription_identifier: Option<u32>,
}

#[derive(Default)]
struct SharedGroup {
    members: Vec<Subscriber>,
    next: usize,
}

impl SharedGroup {
    fn pick(&mut self) -> Option<&Subscriber> {
        if self.members.is_empty() {
            return None;
        }
        let idx = self.next % self.members.len();
        self.next = self.next.wrapping_add(1);
        self.members.get(idx)
    }
}

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    subscribers: Vec<Subscriber>,
    shared_groups: HashMap<String, SharedGroup>,
}

/// Total-ever and currently-live subscription counts. Subscribing an
/// already-present `(client_id, filter)` pair does not bump `total`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub total: u64,
    pub current: u64,
}

/// Which kinds of subscription an [`SubscriptionTrie::iterate`] walk should
/// visit. A plain set of flags rather than a bitmask since nothing else in
/// this codebase reaches for a bitflags-style dependency.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationType {
    pub system: bool,
    pub shared: bool,
    pub non_shared: bool,
}

impl IterationType {
    pub const ALL: Self = Self {
        system: true,
        shared: true,
        non_shared: true,
    };
}

/// Whether `topic` in [`IterationOptions`] is an exact filter string to
/// look up (`Name`), or a concrete topic name to wildcard-match against
/// stored filters the way a PUBLISH fan-out would (`Filter`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Name,
    Filter,
}

impl Default for MatchType {
    fn default() -> Self {
        MatchType::Filter
    }
}

#[derive(Debug, Clone, Default)]
pub struct IterationOptions {
    pub kind: IterationType,
    pub client_id: Option<String>,
    pub topic: Option<String>,
    pub match_type: MatchType,
}

#[derive(Default)]
pub struct SubscriptionTrie {
    root: Node,
    stats: Stats,
    per_client: HashMap<String, Stats>,
}

fn levels(s: &str) -> Vec<&str> {
    s.split('/').collect()
}

impl SubscriptionTrie {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, filter: &str, subscriber: Subscriber) {
        let parsed = parse_filter(filter);
        let mut node = &mut self.root;
        for level in levels(&parsed.filter) {
            node = node.children.entry(level.to_string()).or_default();
        }
        let client_id = subscriber.client_id.clone();
        let is_new = if let Some(group) = parsed.share_name {
            let entry = node.shared_groups.entry(group).or_default();
            let existed = entry.members.iter().any(|s| s.client_id == client_id);
            entry.members.retain(|s| s.client_id != client_id);
            entry.members.push(subscriber);
            !existed
        } else {
            let existed = node.subscribers.iter().any(|s| s.client_id == client_id);
            node.subscribers.retain(|s| s.client_id != client_id);
            node.subscribers.push(subscriber);
            !existed
        };
        if is_new {
            self.stats.total += 1;
            self.stats.current += 1;
            let per = self.per_client.entry(client_id).or_default();
            per.total += 1;
            per.current += 1;
        }
    }

    /// Returns `true` if a matching subscription existed and was removed.
    pub fn unsubscribe(&mut self, filter: &str, client_id: &str) -> bool {
        let parsed = parse_filter(filter);
        let Some(node) = find_mut(&mut self.root, &levels(&parsed.filter)) else {
            return false;
        };
        let removed = if let Some(group) = parsed.share_name {
            let Some(g) = node.shared_groups.get_mut(&group) else {
                return false;
            };
            let before = g.members.len();
            g.members.retain(|s| s.client_id != client_id);
            before != g.members.len()
        } else {
            let before = node.subscribers.len();
            node.subscribers.retain(|s| s.client_id != client_id);
            before != node.subscribers.len()
        };
        if removed {
            self.stats.current = self.stats.current.saturating_sub(1);
            if let Some(per) = self.per_client.get_mut(client_id) {
                per.current = per.current.saturating_sub(1);
            }
        }
        removed
    }

    /// Drop every subscription owned by `client_id`, used when a session
    /// ends for good (clean session, or expiry reaped).
    pub fn remove_client(&mut self, client_id: &str) {
        let removed = remove_client_from(&mut self.root, client_id);
        self.stats.current = self.stats.current.saturating_sub(removed);
        if let Some(per) = self.per_client.get_mut(client_id) {
            per.current = per.current.saturating_sub(removed);
        }
    }

    /// Plain (non-shared) subscribers whose filter matches `topic`, plus
    /// exactly one member chosen per matching shared-subscription group.
    #[must_use]
    pub fn matching(&mut self, topic: &str) -> Vec<Subscriber> {
        let topic_levels = levels(topic);
        let system = is_system_topic(topic);
        let mut out = Vec::new();
        collect(&mut self.root, &topic_levels, system, &mut out);
        out
    }

    /// Every subscriber (including every shared-group member, unlike
    /// [`Self::matching`]'s fair selection) whose filter string equals
    /// `filter` exactly.
    #[must_use]
    pub fn match_name(&self, filter: &str) -> Vec<Subscriber> {
        let parsed = parse_filter(filter);
        let Some(node) = find(&self.root, &levels(&parsed.filter)) else {
            return Vec::new();
        };
        if let Some(group) = &parsed.share_name {
            node.shared_groups.get(group).map(|g| g.members.clone()).unwrap_or_default()
        } else {
            node.subscribers.clone()
        }
    }

    #[must_use]
    pub fn stats(&self) -> Stats {
        self.stats
    }

    #[must_use]
    pub fn client_stats(&self, client_id: &str) -> Stats {
        self.per_client.get(client_id).copied().unwrap_or_default()
    }

    /// Visits every subscription matching `options`, in filter-string
    /// order within a node but otherwise unordered across nodes. The
    /// visitor may stop the walk early by returning `false`.
    pub fn iterate<F>(&self, options: &IterationOptions, mut visitor: F)
    where
        F: FnMut(&str, &Subscriber) -> bool,
    {
        match (&options.topic, options.match_type) {
            (Some(topic), MatchType::Name) => {
                let parsed = parse_filter(topic);
                let Some(node) = find(&self.root, &levels(&parsed.filter)) else {
                    return;
                };
                if let Some(group) = &parsed.share_name {
                    if !options.kind.shared {
                        return;
                    }
                    if let Some(g) = node.shared_groups.get(group) {
                        for s in &g.members {
                            if client_matches(options, s) && !visitor(topic, s) {
                                return;
                            }
                        }
                    }
                } else {
                    if !kind_matches(options.kind, false, &parsed.filter) {
                        return;
                    }
                    for s in &node.subscribers {
                        if client_matches(options, s) && !visitor(topic, s) {
                            return;
                        }
                    }
                }
            }
            (Some(topic), MatchType::Filter) => {
                let topic_levels = levels(topic);
                let system = is_system_topic(topic);
                let mut path = Vec::new();
                walk_matching(&self.root, &topic_levels, &mut path, system, options, &mut visitor);
            }
            (None, _) => {
                let mut path = Vec::new();
                walk_all(&self.root, &mut path, options, &mut visitor);
            }
        }
    }
}

fn find_mut<'a>(node: &'a mut Node, levels: &[&str]) -> Option<&'a mut Node> {
    let mut current = node;
    for level in levels {
        current = current.children.get_mut(*level)?;
    }
    Some(current)
}

fn find<'a>(node: &'a Node, levels: &[&str]) -> Option<&'a Node> {
    let mut current = node;
    for level in levels {
        current = current.children.get(*level)?;
    }
    Some(current)
}

fn remove_client_from(node: &mut Node, client_id: &str) -> u64 {
    let before = node.subscribers.len();
    node.subscribers.retain(|s| s.client_id != client_id);
    let mut removed = (before - node.subscribers.len()) as u64;
    for group in node.shared_groups.values_mut() {
        let before = group.members.len();
        group.members.retain(|s| s.client_id != client_id);
        removed += (before - group.members.len()) as u64;
    }
    node.shared_groups.retain(|_, g| !g.members.is_empty());
    for child in node.children.values_mut() {
        removed += remove_client_from(child, client_id);
    }
    removed
}

fn client_matches(options: &IterationOptions, subscriber: &Subscriber) -> bool {
    match &options.client_id {
        Some(id) => id == &subscriber.client_id,
        None => true,
    }
}

fn kind_matches(kind: IterationType, shared: bool, path: &str) -> bool {
    if shared {
        kind.shared
    } else if is_system_topic(path) {
        kind.system
    } else {
        kind.non_shared
    }
}

/// Visits a leaf node's direct subscribers and shared-group members,
/// honoring `options`'s client/kind filters. Shared members are reported
/// under a reconstructed `$share/<group>/<path>` filter string.
fn visit_leaf<F>(node: &Node, path_str: &str, options: &IterationOptions, visitor: &mut F) -> bool
where
    F: FnMut(&str, &Subscriber) -> bool,
{
    if kind_matches(options.kind, false, path_str) {
        for s in &node.subscribers {
            if client_matches(options, s) && !visitor(path_str, s) {
                return false;
            }
        }
    }
    if options.kind.shared {
        for (group_name, g) in &node.shared_groups {
            let filter_str = format!("$share/{group_name}/{path_str}");
            for s in &g.members {
                if client_matches(options, s) && !visitor(&filter_str, s) {
                    return false;
                }
            }
        }
    }
    true
}

fn walk_all<F>(node: &Node, path: &mut Vec<String>, options: &IterationOptions, visitor: &mut F) -> bool
where
    F: FnMut(&str, &Subscriber) -> bool,
{
    let path_str = path.join("/");
    if !visit_leaf(node, &path_str, options, visitor) {
        return false;
    }
    for (name, child) in &node.children {
        path.push(name.clone());
        let cont = walk_all(child, path, options, visitor);
        path.pop();
        if !cont {
            return false;
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
fn walk_matching<F>(
    node: &Node,
    topic: &[&str],
    path: &mut Vec<String>,
    system_topic: bool,
    options: &IterationOptions,
    visitor: &mut F,
) -> bool
where
    F: FnMut(&str, &Subscriber) -> bool,
{
    let Some((head, rest)) = topic.split_first() else {
        let path_str = path.join("/");
        return visit_leaf(node, &path_str, options, visitor);
    };
    let end = rest.is_empty();
    let next_topic: &[&str] = if end { &[] } else { rest };

    if let Some(child) = node.children.get(*head) {
        path.push((*head).to_string());
        let cont = walk_matching(child, next_topic, path, system_topic, options, visitor);
        path.pop();
        if !cont {
            return false;
        }
    }

    if system_topic {
        // `+` and `#` never reach into `$`-prefixed topics (§4.2).
        return true;
    }

    if let Some(child) = node.children.get("+") {
        path.push("+".to_string());
        let cont = walk_matching(child, next_topic, path, system_topic, options, visitor);
        path.pop();
        if !cont {
            return false;
        }
    }

    if let Some(child) = node.children.get("#") {
        path.push("#".to_string());
        let path_str = path.join("/");
        let cont = visit_leaf(child, &path_str, options, visitor);
        path.pop();
        if !cont {
            return false;
        }
    }

    true
}

fn collect(node: &mut Node, topic: &[&str], system_topic: bool, out: &mut Vec<Subscriber>) {
    let Some((head, rest)) = topic.split_first() else {
        out.extend(node.subscribers.iter().cloned());
        for group in node.shared_groups.values_mut() {
            out.extend(group.pick().cloned());
        }
        return;
    };
    let end = rest.is_empty();

    if let Some(child) = node.children.get_mut(*head) {
        if end {
            out.extend(child.subscribers.iter().cloned());
            for group in child.shared_groups.values_mut() {
                out.extend(group.pick().cloned());
            }
        } else {
            collect(child, rest, system_topic, out);
        }
    }

    if system_topic {
        // `+` and `#` never reach into `$`-prefixed topics (§4.2).
        return;
    }

    if let Some(child) = node.children.get_mut("+") {
        if end {
            out.extend(child.subscribers.iter().cloned());
            for group in child.shared_groups.values_mut() {
                out.extend(group.pick().cloned());
            }
        } else {
            collect(child, rest, system_topic, out);
        }
    }

    if let Some(child) = node.children.get_mut("#") {
        out.extend(child.subscribers.iter().cloned());
        for group in child.shared_groups.values_mut() {
            out.extend(group.pick().cloned());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(client_id: &str) -> Subscriber {
        Subscriber {
            client_id: client_id.to_string(),
            qos: QoS::AtLeastOnce,
            no_local: false,
            retain_as_published: false,
            subscription_identifier: None,
        }
    }

    #[test]
    fn matches_single_level_plus_wildcard() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/+/c", sub("client-1"));
        assert_eq!(trie.matching("a/x/c").len(), 1);
        assert!(trie.matching("a/x/y").is_empty());
    }

    #[test]
    fn hash_wildcard_excludes_system_topics() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("#", sub("client-1"));
        assert!(trie.matching("a/b").len() == 1);
        assert!(trie.matching("$SYS/uptime").is_empty());
    }

    #[test]
    fn shared_subscription_round_robins_across_members() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("$share/workers/job", sub("w1"));
        trie.subscribe("$share/workers/job", sub("w2"));
        let first = trie.matching("job");
        let second = trie.matching("job");
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_ne!(first[0].client_id, second[0].client_id);
    }

    #[test]
    fn unsubscribe_removes_only_named_client() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("a/b", sub("client-2"));
        assert!(trie.unsubscribe("a/b", "client-1"));
        let remaining = trie.matching("a/b");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].client_id, "client-2");
    }

    #[test]
    fn remove_client_clears_every_filter() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("c/d", sub("client-1"));
        trie.remove_client("client-1");
        assert!(trie.matching("a/b").is_empty());
        assert!(trie.matching("c/d").is_empty());
    }

    #[test]
    fn stats_count_total_and_current_without_double_counting_resubscribe() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("a/b", sub("client-1"));
        assert_eq!(trie.stats(), Stats { total: 1, current: 1 });
        trie.subscribe("c/d", sub("client-1"));
        assert_eq!(trie.stats(), Stats { total: 2, current: 2 });
        assert_eq!(trie.client_stats("client-1"), Stats { total: 2, current: 2 });

        trie.unsubscribe("a/b", "client-1");
        assert_eq!(trie.stats(), Stats { total: 2, current: 1 });
        assert_eq!(trie.client_stats("client-1"), Stats { total: 2, current: 1 });
    }

    #[test]
    fn remove_client_decrements_current_but_not_total() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("c/d", sub("client-1"));
        trie.remove_client("client-1");
        assert_eq!(trie.stats(), Stats { total: 2, current: 0 });
    }

    #[test]
    fn match_name_finds_exact_filter_including_every_shared_member() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("$share/workers/job", sub("w1"));
        trie.subscribe("$share/workers/job", sub("w2"));
        trie.subscribe("a/+/c", sub("client-1"));
        assert_eq!(trie.match_name("$share/workers/job").len(), 2);
        assert_eq!(trie.match_name("a/+/c").len(), 1);
        assert!(trie.match_name("a/b/c").is_empty(), "match_name is exact, not wildcard");
    }

    #[test]
    fn iterate_by_client_id_visits_only_that_clients_subscriptions() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("c/d", sub("client-2"));
        let options = IterationOptions {
            kind: IterationType::ALL,
            client_id: Some("client-1".to_string()),
            topic: None,
            match_type: MatchType::Filter,
        };
        let mut seen = Vec::new();
        trie.iterate(&options, |filter, s| {
            seen.push((filter.to_string(), s.client_id.clone()));
            true
        });
        assert_eq!(seen, vec![("a/b".to_string(), "client-1".to_string())]);
    }

    #[test]
    fn iterate_can_stop_early() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/b", sub("client-1"));
        trie.subscribe("c/d", sub("client-2"));
        let options = IterationOptions::default();
        let mut count = 0;
        trie.iterate(&options, |_, _| {
            count += 1;
            false
        });
        assert_eq!(count, 1);
    }

    #[test]
    fn iterate_by_name_matches_exact_filter_like_match_name() {
        let mut trie = SubscriptionTrie::new();
        trie.subscribe("a/+/c", sub("client-1"));
        let options = IterationOptions {
            kind: IterationType::ALL,
            client_id: None,
            topic: Some("a/+/c".to_string()),
            match_type: MatchType::Name,
        };
        let mut seen = 0;
        trie.iterate(&options, |_, _| {
            seen += 1;
            true
        });
        assert_eq!(seen, 1);
    }
}
