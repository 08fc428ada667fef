//! Subscription index: a trie keyed on topic levels. Each node holds the
//! subscribers whose filter terminates there; `+` and `#` are dedicated
//! child edges.

use std::str::FromStr;

use parking_lot::RwLock;

use crate::topic::{Level, Topic, TopicError};
use crate::types::{ClientId, HashMap, QoS, Subscription, TopicFilter};

pub type SubscriptionTree = Node;

pub struct Node {
    // client id => requested QoS, re-insert replaces the QoS
    subscribers: HashMap<ClientId, QoS>,
    branches: HashMap<Level, Node>,
}

impl Default for Node {
    #[inline]
    fn default() -> Node {
        Self { subscribers: HashMap::default(), branches: HashMap::default() }
    }
}

impl Node {
    #[inline]
    pub fn insert(&mut self, topic_filter: &Topic, client_id: ClientId, qos: QoS) -> bool {
        let mut path = topic_filter.levels().clone();
        path.reverse();
        self._insert(path, client_id, qos)
    }

    #[inline]
    fn _insert(&mut self, mut path: Vec<Level>, client_id: ClientId, qos: QoS) -> bool {
        if let Some(first) = path.pop() {
            self.branches.entry(first).or_default()._insert(path, client_id, qos)
        } else {
            self.subscribers.insert(client_id, qos).is_none()
        }
    }

    #[inline]
    pub fn remove(&mut self, topic_filter: &Topic, client_id: &ClientId) -> bool {
        self._remove(topic_filter.levels().as_ref(), client_id)
    }

    #[inline]
    fn _remove(&mut self, path: &[Level], client_id: &ClientId) -> bool {
        if path.is_empty() {
            self.subscribers.remove(client_id).is_some()
        } else {
            let t = &path[0];
            if let Some(x) = self.branches.get_mut(t) {
                let res = x._remove(&path[1..], client_id);
                if x.subscribers.is_empty() && x.branches.is_empty() {
                    self.branches.remove(t);
                }
                res
            } else {
                false
            }
        }
    }

    ///All subscriptions whose filter admits `topic`. The same client may
    ///appear more than once when reached through different wildcard
    ///branches; the caller collapses per client.
    #[inline]
    pub fn matches(&self, topic: &Topic) -> Vec<Subscription> {
        let mut out = Vec::new();
        self._matches(topic.levels(), Vec::new(), &mut out);
        out
    }

    #[inline]
    fn _matches(&self, path: &[Level], mut sub_path: Vec<Level>, out: &mut Vec<Subscription>) {
        let add_to_out = |mut levels: Vec<Level>, tail: Option<Level>, subscribers: &HashMap<ClientId, QoS>, out: &mut Vec<Subscription>| {
            if subscribers.is_empty() {
                return;
            }
            if let Some(tail) = tail {
                levels.push(tail);
            }
            let topic_filter = TopicFilter::from(Topic::from(levels).to_string());
            for (client_id, qos) in subscribers.iter() {
                out.push(Subscription {
                    client_id: client_id.clone(),
                    topic_filter: topic_filter.clone(),
                    qos: *qos,
                });
            }
        };

        if path.is_empty() {
            //subscription ending with #, matches the parent level too
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                add_to_out(sub_path.clone(), Some(Level::MultiWildcard), &n.subscribers, out);
            }
            add_to_out(sub_path, None, &self.subscribers, out);
        } else {
            //Multilayer matching
            if let Some(n) = self.branches.get(&Level::MultiWildcard) {
                add_to_out(sub_path.clone(), Some(Level::MultiWildcard), &n.subscribers, out);
            }

            //Single layer matching
            if let Some(n) = self.branches.get(&Level::SingleWildcard) {
                let mut sub_path = sub_path.clone();
                sub_path.push(Level::SingleWildcard);
                n._matches(&path[1..], sub_path, out);
            }

            //Precise matching
            if let Some(n) = self.branches.get(&path[0]) {
                sub_path.push(path[0].clone());
                n._matches(&path[1..], sub_path, out);
            }
        }
    }

    #[inline]
    pub fn values_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.values_size()).sum();
        self.subscribers.len() + len
    }

    #[inline]
    pub fn nodes_size(&self) -> usize {
        let len: usize = self.branches.values().map(|n| n.nodes_size()).sum();
        self.branches.len() + len
    }
}

///Concurrent view over the subscription tree. Readers see a consistent
///snapshot; writers serialize on the inner lock.
pub struct SubscriptionMatcher {
    tree: RwLock<SubscriptionTree>,
}

impl Default for SubscriptionMatcher {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionMatcher {
    #[inline]
    pub fn new() -> Self {
        Self { tree: RwLock::new(SubscriptionTree::default()) }
    }

    ///Rejects the empty filter, non-terminal `#` and wildcards mixed with
    ///other characters in one level.
    #[inline]
    pub fn validate(topic_filter: &str) -> Result<Topic, TopicError> {
        Topic::from_str(topic_filter)
    }

    #[inline]
    pub fn add(&self, topic_filter: &Topic, client_id: ClientId, qos: QoS) -> bool {
        self.tree.write().insert(topic_filter, client_id, qos)
    }

    #[inline]
    pub fn remove(&self, topic_filter: &Topic, client_id: &ClientId) -> bool {
        self.tree.write().remove(topic_filter, client_id)
    }

    #[inline]
    pub fn matches(&self, topic: &Topic) -> Vec<Subscription> {
        self.tree.read().matches(topic)
    }

    #[inline]
    pub fn subscriptions_size(&self) -> usize {
        self.tree.read().values_size()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{SubscriptionMatcher, SubscriptionTree, Topic};
    use crate::types::{ClientId, QoS};

    fn match_one(tree: &SubscriptionTree, topic: &str, vs: &[(&str, QoS)]) -> bool {
        let mut matcheds = 0;
        let t = Topic::from_str(topic).unwrap();
        for sub in tree.matches(&t).iter() {
            println!("[trie] {}({}) => {:?}, {:?}", topic, sub.topic_filter, sub.client_id, vs);
            if !vs.contains(&(sub.client_id.as_ref(), sub.qos)) {
                return false;
            }
            matcheds += 1;
        }
        matcheds == vs.len()
    }

    fn insert(tree: &mut SubscriptionTree, filter: &str, client_id: &str, qos: QoS) -> bool {
        tree.insert(&Topic::from_str(filter).unwrap(), ClientId::from(client_id), qos)
    }

    #[test]
    fn trie() {
        let mut tree = SubscriptionTree::default();
        assert!(insert(&mut tree, "/iot/b/x", "c1", QoS::AtMostOnce));
        assert!(insert(&mut tree, "/iot/b/x", "c2", QoS::AtLeastOnce));
        assert!(insert(&mut tree, "/iot/b/y", "c3", QoS::ExactlyOnce));
        assert!(insert(&mut tree, "/ddl/22/#", "c5", QoS::AtLeastOnce));
        assert!(insert(&mut tree, "/ddl/+/+", "c6", QoS::AtMostOnce));
        assert!(insert(&mut tree, "/xyz/yy/zz", "c7", QoS::ExactlyOnce));

        assert!(match_one(&tree, "/iot/b/x", &[("c1", QoS::AtMostOnce), ("c2", QoS::AtLeastOnce)]));
        assert!(match_one(&tree, "/iot/b/y", &[("c3", QoS::ExactlyOnce)]));
        assert!(match_one(&tree, "/ddl/a/b", &[("c6", QoS::AtMostOnce)]));
        assert!(match_one(&tree, "/ddl/22/1/2", &[("c5", QoS::AtLeastOnce)]));
        assert!(match_one(&tree, "/ddl/22/1", &[("c5", QoS::AtLeastOnce), ("c6", QoS::AtMostOnce)]));
        assert!(match_one(&tree, "/ddl/22/", &[("c5", QoS::AtLeastOnce), ("c6", QoS::AtMostOnce)]));
        assert!(match_one(&tree, "/ddl/22", &[("c5", QoS::AtLeastOnce)]));

        assert!(tree.remove(&Topic::from_str("/xyz/yy/zz").unwrap(), &ClientId::from("c7")));
        assert!(!tree.remove(&Topic::from_str("/xyz").unwrap(), &ClientId::from("c123")));
        assert!(!match_one(&tree, "/xyz/yy/zz", &[("c7", QoS::ExactlyOnce)]));
    }

    #[test]
    fn trie_requeue_overwrites_qos() {
        let mut tree = SubscriptionTree::default();
        assert!(insert(&mut tree, "a/b", "c1", QoS::AtMostOnce));
        //same (client, filter), QoS replaced
        assert!(!insert(&mut tree, "a/b", "c1", QoS::ExactlyOnce));
        assert!(match_one(&tree, "a/b", &[("c1", QoS::ExactlyOnce)]));
        assert_eq!(tree.values_size(), 1);
    }

    #[test]
    fn trie_prunes_empty_nodes() {
        let mut tree = SubscriptionTree::default();
        assert!(insert(&mut tree, "a/b/c/d", "c1", QoS::AtMostOnce));
        assert!(tree.nodes_size() > 0);
        assert!(tree.remove(&Topic::from_str("a/b/c/d").unwrap(), &ClientId::from("c1")));
        assert_eq!(tree.nodes_size(), 0);
        assert_eq!(tree.values_size(), 0);
    }

    #[test]
    fn trie_hash_match_includes_parent() {
        let mut tree = SubscriptionTree::default();
        assert!(insert(&mut tree, "sport/#", "c1", QoS::AtLeastOnce));
        assert!(match_one(&tree, "sport", &[("c1", QoS::AtLeastOnce)]));
        assert!(match_one(&tree, "sport/tennis", &[("c1", QoS::AtLeastOnce)]));
    }

    #[test]
    fn trie_duplicates_via_distinct_branches() {
        let mut tree = SubscriptionTree::default();
        assert!(insert(&mut tree, "a/+", "c1", QoS::AtMostOnce));
        assert!(insert(&mut tree, "a/b", "c1", QoS::ExactlyOnce));
        //both filters admit a/b, the same client shows up twice
        let out = tree.matches(&Topic::from_str("a/b").unwrap());
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn matcher_validate() {
        assert!(SubscriptionMatcher::validate("a/b/+").is_ok());
        assert!(SubscriptionMatcher::validate("a/#").is_ok());
        assert!(SubscriptionMatcher::validate("").is_err());
        assert!(SubscriptionMatcher::validate("a/#/b").is_err());
        assert!(SubscriptionMatcher::validate("a/b+").is_err());
    }
}
