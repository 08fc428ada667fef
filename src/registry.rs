use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;

use crate::sink::Channel;
use crate::types::{ClientId, DashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    SendAck,
    SessionCreated,
    MessagesRepublished,
    Established,
    SubscriptionsRemoved,
    MessagesDropped,
    InterceptorsNotified,
}

impl ConnectionState {
    #[inline]
    fn from_u8(v: u8) -> ConnectionState {
        match v {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::SendAck,
            2 => ConnectionState::SessionCreated,
            3 => ConnectionState::MessagesRepublished,
            4 => ConnectionState::Established,
            5 => ConnectionState::SubscriptionsRemoved,
            6 => ConnectionState::MessagesDropped,
            _ => ConnectionState::InterceptorsNotified,
        }
    }
}

///Live connection of one client. The state advances through
///compare-and-set only; a failed transition aborts the whole handler
///without partial side effects. The channel is closed exclusively
///through `abort` or the final transition of a disconnect sequence.
pub struct ConnectionDescriptor {
    pub client_id: ClientId,
    pub channel: Arc<Channel>,
    pub clean_session: bool,
    state: AtomicU8,
}

impl fmt::Debug for ConnectionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConnectionDescriptor {{ {:?}, clean_session: {}, state: {:?} }}",
            self.client_id,
            self.clean_session,
            self.state()
        )
    }
}

impl ConnectionDescriptor {
    #[inline]
    pub fn new(client_id: ClientId, channel: Arc<Channel>, clean_session: bool) -> Self {
        Self { client_id, channel, clean_session, state: AtomicU8::new(ConnectionState::Disconnected as u8) }
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn assign_state(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    #[inline]
    pub fn abort(&self) {
        log::debug!("{:?} abort, closing channel", self);
        self.channel.close();
    }
}

///One descriptor per client id; admission goes through `put_if_absent`
///only. The reconnecting side map records ids displaced by a newer
///CONNECT so their loss handler skips will publication.
pub struct ConnectionRegistry {
    descriptors: DashMap<ClientId, Arc<ConnectionDescriptor>>,
    reconnecting: DashMap<ClientId, Arc<ConnectionDescriptor>>,
}

impl Default for ConnectionRegistry {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    #[inline]
    pub fn new() -> Self {
        Self { descriptors: DashMap::default(), reconnecting: DashMap::default() }
    }

    ///Returns the existing descriptor when the id is already taken, in
    ///which case the new one was not inserted.
    #[inline]
    pub fn put_if_absent(&self, descriptor: Arc<ConnectionDescriptor>) -> Option<Arc<ConnectionDescriptor>> {
        match self.descriptors.entry(descriptor.client_id.clone()) {
            Entry::Occupied(e) => Some(e.get().clone()),
            Entry::Vacant(v) => {
                v.insert(descriptor);
                None
            }
        }
    }

    #[inline]
    pub fn get(&self, client_id: &ClientId) -> Option<Arc<ConnectionDescriptor>> {
        self.descriptors.get(client_id).map(|e| e.value().clone())
    }

    ///Removes only when the stored descriptor is this very one.
    #[inline]
    pub fn remove_if_same(&self, client_id: &ClientId, descriptor: &Arc<ConnectionDescriptor>) -> bool {
        self.descriptors.remove_if(client_id, |_, d| Arc::ptr_eq(d, descriptor)).is_some()
    }

    ///Removes only when the stored descriptor owns this channel.
    #[inline]
    pub fn remove_if_channel(
        &self,
        client_id: &ClientId,
        channel: &Arc<Channel>,
    ) -> Option<Arc<ConnectionDescriptor>> {
        self.descriptors.remove_if(client_id, |_, d| Arc::ptr_eq(&d.channel, channel)).map(|(_, d)| d)
    }

    #[inline]
    pub fn mark_reconnecting(&self, descriptor: Arc<ConnectionDescriptor>) {
        self.reconnecting.insert(descriptor.client_id.clone(), descriptor);
    }

    #[inline]
    pub fn take_reconnecting(&self, client_id: &ClientId) -> Option<Arc<ConnectionDescriptor>> {
        self.reconnecting.remove(client_id).map(|(_, d)| d)
    }

    #[inline]
    pub fn connections_count(&self) -> usize {
        self.descriptors.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::mock;

    fn descriptor(client_id: &str) -> Arc<ConnectionDescriptor> {
        let (_, channel) = mock::channel();
        Arc::new(ConnectionDescriptor::new(ClientId::from(client_id), channel, true))
    }

    #[test]
    fn state_is_compare_and_set() {
        let d = descriptor("c1");
        assert_eq!(d.state(), ConnectionState::Disconnected);
        assert!(d.assign_state(ConnectionState::Disconnected, ConnectionState::SendAck));
        //stale expectation fails and leaves the state alone
        assert!(!d.assign_state(ConnectionState::Disconnected, ConnectionState::SessionCreated));
        assert_eq!(d.state(), ConnectionState::SendAck);
    }

    #[test]
    fn put_if_absent_is_exclusive() {
        let registry = ConnectionRegistry::new();
        let d1 = descriptor("c1");
        let d2 = descriptor("c1");
        assert!(registry.put_if_absent(d1.clone()).is_none());
        let existing = registry.put_if_absent(d2).expect("existing descriptor");
        assert!(Arc::ptr_eq(&existing, &d1));
        assert_eq!(registry.connections_count(), 1);
    }

    #[test]
    fn remove_is_by_identity() {
        let registry = ConnectionRegistry::new();
        let d1 = descriptor("c1");
        let d2 = descriptor("c1");
        assert!(registry.put_if_absent(d1.clone()).is_none());
        //a different descriptor for the same id does not remove the entry
        assert!(!registry.remove_if_same(&ClientId::from("c1"), &d2));
        assert!(registry.remove_if_same(&ClientId::from("c1"), &d1));
        assert_eq!(registry.connections_count(), 0);
    }

    #[test]
    fn reconnecting_side_map() {
        let registry = ConnectionRegistry::new();
        let d1 = descriptor("c1");
        registry.mark_reconnecting(d1.clone());
        assert!(registry.take_reconnecting(&ClientId::from("c1")).is_some());
        assert!(registry.take_reconnecting(&ClientId::from("c1")).is_none());
    }
}
