// Copyright (c) 2024 EmberMQ contributors. All rights reserved.
// Use of this source is governed by an Apache-2.0 license that can be found
// in the LICENSE file.

//! Last-retained-message-per-topic store. A topic's retained message is
//! replaced by every retained PUBLISH to that topic and cleared by a
//! retained PUBLISH with an empty payload (§4.2).

use std::collections::HashMap;

use embermq_codec::message::Message;
use embermq_codec::topic::is_system_topic;

#[derive(Default)]
struct Node {
    children: HashMap<String, Node>,
    message: Option<Message>,
}

impl Node {
    fn pre_order_collect(&self, out: &mut Vec<Message>) {
        if let Some(message) = &self.message {
            out.push(message.clone());
        }
        for child in self.children.values() {
            child.pre_order_collect(out);
        }
    }
}

#[derive(Default)]
pub struct RetainedStore {
    root: Node,
}

fn levels(topic: &str) -> Vec<&str> {
    topic.split('/').collect()
}

impl RetainedStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or clear (when `message.payload` is empty) the retained
    /// message for `message.topic`.
    pub fn publish(&mut self, message: Message) {
        if message.payload.is_empty() {
            self.clear(&message.topic);
            return;
        }
        let mut node = &mut self.root;
        for level in levels(&message.topic) {
            node = node.children.entry(level.to_string()).or_default();
        }
        node.message = Some(message);
    }

    pub fn clear(&mut self, topic: &str) {
        let mut node = &mut self.root;
        for level in levels(topic) {
            node = match node.children.get_mut(level) {
                Some(child) => child,
                None => return,
            };
        }
        node.message = None;
    }

    /// Every retained message whose topic matches `filter`, following the
    /// usual `+`/`#` walk and excluding system topics from a
    /// wildcard-rooted filter.
    #[must_use]
    pub fn matching(&self, filter: &str) -> Vec<Message> {
        let filter_levels = levels(filter);
        let mut out = Vec::new();
        if matches!(filter_levels.first(), Some(&"+") | Some(&"#")) {
            // a wildcard-rooted filter never reaches into `$`-prefixed
            // topics; walk only the non-system children explicitly.
            for (name, child) in &self.root.children {
                if is_system_topic(name) {
                    continue;
                }
                child.match_topic(&filter_levels, &mut out);
            }
            return out;
        }
        self.root.match_topic(&filter_levels, &mut out);
        out
    }
}

impl Node {
    fn match_topic(&self, filter: &[&str], out: &mut Vec<Message>) {
        let Some((head, rest)) = filter.split_first() else {
            return;
        };
        let end = rest.is_empty();
        match *head {
            "#" => self.pre_order_collect(out),
            "+" => {
                for child in self.children.values() {
                    if end {
                        if let Some(message) = &child.message {
                            out.push(message.clone());
                        }
                    } else {
                        child.match_topic(rest, out);
                    }
                }
            }
            literal => {
                if let Some(child) = self.children.get(literal) {
                    if end {
                        if let Some(message) = &child.message {
                            out.push(message.clone());
                        }
                    } else {
                        child.match_topic(rest, out);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embermq_codec::header::QoS;

    fn retained(topic: &str, payload: &[u8]) -> Message {
        Message {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: false,
            packet_id: None,
            content_type: None,
            correlation_data: None,
            message_expiry_seconds: None,
            payload_is_utf8: false,
            response_topic: None,
            subscription_identifiers: Vec::new(),
        }
    }

    #[test]
    fn replays_retained_message_to_matching_filter() {
        let mut store = RetainedStore::new();
        store.publish(retained("a/b", b"v1"));
        let found = store.matching("a/+");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].payload, b"v1");
    }

    #[test]
    fn empty_payload_clears_retained_message() {
        let mut store = RetainedStore::new();
        store.publish(retained("a/b", b"v1"));
        store.publish(retained("a/b", b""));
        assert!(store.matching("a/b").is_empty());
    }

    #[test]
    fn wildcard_filter_excludes_system_topics() {
        let mut store = RetainedStore::new();
        store.publish(retained("$SYS/uptime", b"42"));
        store.publish(retained("a/b", b"v1"));
        let found = store.matching("#");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].topic, "a/b");
    }
}
