use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use once_cell::sync::OnceCell;

use crate::types::{ClientId, Packet, UserName};
use crate::{MqttError, Result};

///Write side of one client connection, owned by the transport and
///injected here. Implementations enqueue on the connection's write
///buffer and never block.
pub trait Sink: Sync + Send {
    fn send(&self, packet: Packet) -> Result<()>;

    ///Hint that the write buffer has room. When false, outbound QoS1/2
    ///messages are parked on the session instead.
    #[inline]
    fn is_writable(&self) -> bool {
        true
    }

    fn flush(&self);

    fn close(&self);
}

///Per-connection handle: the sink plus the attributes the director pins
///on the connection during CONNECT.
pub struct Channel {
    sink: Arc<dyn Sink>,
    client_id: OnceCell<ClientId>,
    username: OnceCell<UserName>,
    last_activity: AtomicI64,
    pending_writes: AtomicBool,
    closed: AtomicBool,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Channel {{ client_id: {:?}, closed: {} }}",
            self.client_id.get(),
            self.closed.load(Ordering::SeqCst)
        )
    }
}

impl Channel {
    #[inline]
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            client_id: OnceCell::new(),
            username: OnceCell::new(),
            last_activity: AtomicI64::new(chrono::Local::now().timestamp_millis()),
            pending_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn send(&self, packet: Packet) -> Result<()> {
        if self.is_closed() {
            return Err(MqttError::ChannelClosed);
        }
        self.sink.send(packet)?;
        self.pending_writes.store(true, Ordering::SeqCst);
        Ok(())
    }

    #[inline]
    pub fn flush(&self) {
        self.pending_writes.store(false, Ordering::SeqCst);
        self.sink.flush();
    }

    ///Flushes only when writes happened since the last flush. Driven by
    ///the auto-flush timer.
    #[inline]
    pub fn flush_pending(&self) {
        if self.pending_writes.swap(false, Ordering::SeqCst) {
            self.sink.flush();
        }
    }

    #[inline]
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("{:?} close channel", self);
            self.sink.close();
        }
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        !self.is_closed() && self.sink.is_writable()
    }

    ///Records packet activity for the keep-alive idle tracker.
    #[inline]
    pub fn touch(&self) {
        self.last_activity.store(chrono::Local::now().timestamp_millis(), Ordering::SeqCst);
    }

    #[inline]
    pub fn idle_millis(&self) -> i64 {
        chrono::Local::now().timestamp_millis() - self.last_activity.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn set_client_id(&self, client_id: ClientId) {
        let _ = self.client_id.set(client_id);
    }

    #[inline]
    pub fn client_id(&self) -> Option<&ClientId> {
        self.client_id.get()
    }

    #[inline]
    pub fn set_username(&self, username: UserName) {
        let _ = self.username.set(username);
    }

    #[inline]
    pub fn username(&self) -> Option<&UserName> {
        self.username.get()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::{Channel, Sink};
    use crate::types::Packet;
    use crate::{MqttError, Result};

    #[derive(Default)]
    pub(crate) struct MockSink {
        packets: Mutex<Vec<Packet>>,
        writable: AtomicBool,
        closed: AtomicBool,
        flushes: AtomicUsize,
    }

    impl MockSink {
        pub(crate) fn new() -> Arc<Self> {
            let s = Self::default();
            s.writable.store(true, Ordering::SeqCst);
            Arc::new(s)
        }

        pub(crate) fn set_writable(&self, writable: bool) {
            self.writable.store(writable, Ordering::SeqCst);
        }

        pub(crate) fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub(crate) fn packets(&self) -> Vec<Packet> {
            self.packets.lock().clone()
        }

        pub(crate) fn take_packets(&self) -> Vec<Packet> {
            std::mem::take(&mut *self.packets.lock())
        }

        pub(crate) fn flush_count(&self) -> usize {
            self.flushes.load(Ordering::SeqCst)
        }
    }

    impl Sink for MockSink {
        fn send(&self, packet: Packet) -> Result<()> {
            if self.is_closed() {
                return Err(MqttError::ChannelClosed);
            }
            self.packets.lock().push(packet);
            Ok(())
        }

        fn is_writable(&self) -> bool {
            self.writable.load(Ordering::SeqCst)
        }

        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    pub(crate) fn channel() -> (Arc<MockSink>, Arc<Channel>) {
        let sink = MockSink::new();
        let channel = Arc::new(Channel::new(sink.clone()));
        (sink, channel)
    }
}

#[cfg(test)]
mod tests {
    use super::mock;
    use crate::types::Packet;

    #[test]
    fn channel_send_and_flush_pending() {
        let (sink, channel) = mock::channel();
        channel.send(Packet::PingResponse).unwrap();
        channel.flush_pending();
        assert_eq!(sink.flush_count(), 1);
        //no writes since the last flush, the timer skips the sink
        channel.flush_pending();
        assert_eq!(sink.flush_count(), 1);
    }

    #[test]
    fn closed_channel_rejects_writes() {
        let (sink, channel) = mock::channel();
        channel.close();
        assert!(sink.is_closed());
        assert!(channel.send(Packet::PingResponse).is_err());
        assert!(!channel.is_writable());
    }

    #[test]
    fn client_id_is_set_once() {
        let (_, channel) = mock::channel();
        channel.set_client_id("c1".into());
        channel.set_client_id("c2".into());
        assert_eq!(channel.client_id(), Some(&crate::types::ClientId::from("c1")));
    }
}
