use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use linked_hash_map::LinkedHashMap;

use crate::types::{HashMap, MsgId, PacketId, QoS, TimestampMillis};
use crate::{MqttError, Result};

#[derive(Debug, Clone)]
pub struct InflightMessage {
    pub msg_id: MsgId,
    ///effective QoS granted to this recipient
    pub qos: QoS,
    pub update_time: TimestampMillis,
}

impl InflightMessage {
    #[inline]
    pub fn new(msg_id: MsgId, qos: QoS) -> Self {
        Self { msg_id, qos, update_time: chrono::Local::now().timestamp_millis() }
    }
}

type FirstPhaseQueue = LinkedHashMap<PacketId, InflightMessage, ahash::RandomState>;

///Outbound delivery windows of one session. The first phase holds QoS1
///messages awaiting PUBACK and QoS2 messages awaiting PUBREC, in send
///order; the second phase holds QoS2 messages awaiting PUBCOMP. A packet
///id lives in at most one of the two.
pub struct Inflight {
    next: Arc<AtomicU16>,
    first_phase: FirstPhaseQueue,
    second_phase: HashMap<PacketId, InflightMessage>,
}

impl Default for Inflight {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl Inflight {
    #[inline]
    pub fn new() -> Self {
        Self {
            next: Arc::new(AtomicU16::new(1)),
            first_phase: FirstPhaseQueue::default(),
            second_phase: HashMap::default(),
        }
    }

    ///Strictly increasing modulo 65535, skipping ids currently live in
    ///either window.
    #[inline]
    pub fn next_id(&self) -> Result<PacketId> {
        for _ in 0..u16::MAX {
            let packet_id = self.next.fetch_add(1, Ordering::SeqCst);
            if packet_id == 0 {
                continue;
            }
            if !self.first_phase.contains_key(&packet_id) && !self.second_phase.contains_key(&packet_id) {
                return Ok(packet_id);
            }
        }
        Err(MqttError::PacketIdExhausted)
    }

    #[inline]
    pub fn push_back(&mut self, packet_id: PacketId, m: InflightMessage) {
        self.first_phase.insert(packet_id, m);
    }

    #[inline]
    pub fn get(&self, packet_id: PacketId) -> Option<&InflightMessage> {
        self.first_phase.get(&packet_id)
    }

    ///PUBACK received, the entry leaves the window.
    #[inline]
    pub fn acknowledged(&mut self, packet_id: PacketId) -> Option<InflightMessage> {
        self.first_phase.remove(&packet_id)
    }

    ///PUBREC received, move to the PUBCOMP wait.
    #[inline]
    pub fn move_to_second_phase(&mut self, packet_id: PacketId) -> bool {
        if let Some(mut m) = self.first_phase.remove(&packet_id) {
            m.update_time = chrono::Local::now().timestamp_millis();
            self.second_phase.insert(packet_id, m);
            true
        } else {
            false
        }
    }

    ///PUBCOMP received.
    #[inline]
    pub fn second_phase_acknowledged(&mut self, packet_id: PacketId) -> Option<InflightMessage> {
        self.second_phase.remove(&packet_id)
    }

    ///Empties the first phase in send order, for republish on reconnect.
    ///The second phase is left alone.
    #[inline]
    pub fn drain(&mut self) -> Vec<InflightMessage> {
        let mut out = Vec::with_capacity(self.first_phase.len());
        while let Some((_, m)) = self.first_phase.pop_front() {
            out.push(m);
        }
        out
    }

    #[inline]
    pub fn exist(&self, packet_id: &PacketId) -> bool {
        self.first_phase.contains_key(packet_id) || self.second_phase.contains_key(packet_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.first_phase.len() + self.second_phase.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn clear(&mut self) {
        self.first_phase.clear();
        self.second_phase.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: &str) -> InflightMessage {
        InflightMessage::new(MsgId::from(id.to_owned()), QoS::AtLeastOnce)
    }

    #[test]
    fn inflight_next_id_skips_live_ids() {
        let mut w = Inflight::new();
        let a = w.next_id().unwrap();
        assert_eq!(a, 1);
        w.push_back(2, msg("m2"));
        w.push_back(3, msg("m3"));
        assert!(w.move_to_second_phase(3));
        //2 and 3 are live in one of the windows, both skipped
        assert_eq!(w.next_id().unwrap(), 4);
    }

    #[test]
    fn inflight_phases_are_disjoint() {
        let mut w = Inflight::new();
        w.push_back(10, msg("m"));
        assert!(w.exist(&10));
        assert!(w.move_to_second_phase(10));
        assert!(w.get(10).is_none());
        assert!(w.exist(&10));
        //a second move is a no-op
        assert!(!w.move_to_second_phase(10));
        assert!(w.second_phase_acknowledged(10).is_some());
        assert!(!w.exist(&10));
        assert!(w.is_empty());
    }

    #[test]
    fn inflight_drain_keeps_send_order() {
        let mut w = Inflight::new();
        w.push_back(5, msg("first"));
        w.push_back(9, msg("second"));
        w.push_back(2, msg("third"));
        let drained = w.drain();
        assert_eq!(
            drained.iter().map(|m| m.msg_id.as_ref()).collect::<Vec<&str>>(),
            vec!["first", "second", "third"]
        );
        assert!(w.is_empty());
    }

    #[test]
    fn inflight_acknowledged_removes() {
        let mut w = Inflight::new();
        w.push_back(7, msg("m"));
        assert!(w.acknowledged(7).is_some());
        assert!(w.acknowledged(7).is_none());
    }
}
