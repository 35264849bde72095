//! Result handlers
//!
//! Every operation that produces results takes a [`Handler`]. Whatever shape
//! the caller picks, the session only ever sees a [`Sink`]: a callback for
//! each result plus an optional cleanup that runs once when the operation ends.

use crate::channel::{BoundedChannel, ChannelState, Received};

/// Default capacity of channel handlers.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

type Callback<T> = Box<dyn FnMut(Received<T>) + Send>;
type Cleanup = Box<dyn FnOnce() + Send>;

/// How an operation hands its results to the application.
pub enum Handler<T> {
    /// Invoked on the dispatch task for every result, then once with
    /// `Received::Disconnected` when the operation ends.
    Callback(Callback<T>),
    /// Like `Callback`, and the second closure runs after the final call.
    CallbackWithDrop(Callback<T>, Cleanup),
    /// Reject-newest channel of the given capacity.
    Fifo(usize),
    /// Evict-oldest channel of the given capacity.
    Ring(usize),
}

impl<T> Default for Handler<T> {
    fn default() -> Self {
        Handler::Fifo(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl<T> std::fmt::Debug for Handler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Callback(_) => f.write_str("Callback"),
            Handler::CallbackWithDrop(_, _) => f.write_str("CallbackWithDrop"),
            Handler::Fifo(capacity) => f.debug_tuple("Fifo").field(capacity).finish(),
            Handler::Ring(capacity) => f.debug_tuple("Ring").field(capacity).finish(),
        }
    }
}

impl<T: Send + 'static> Handler<T> {
    pub fn callback(f: impl FnMut(Received<T>) + Send + 'static) -> Self {
        Handler::Callback(Box::new(f))
    }

    pub fn callback_with_drop(
        f: impl FnMut(Received<T>) + Send + 'static,
        on_drop: impl FnOnce() + Send + 'static,
    ) -> Self {
        Handler::CallbackWithDrop(Box::new(f), Box::new(on_drop))
    }

    /// Normalize into a sink, plus the receiving channel for channel handlers.
    pub(crate) fn into_sink(self) -> (Sink<T>, Option<BoundedChannel<T>>) {
        match self {
            Handler::Callback(callback) => (Sink::new(callback, None, None), None),
            Handler::CallbackWithDrop(callback, cleanup) => {
                (Sink::new(callback, Some(cleanup), None), None)
            }
            Handler::Fifo(capacity) => Self::channel(BoundedChannel::fifo(capacity)),
            Handler::Ring(capacity) => Self::channel(BoundedChannel::ring(capacity)),
        }
    }

    fn channel(channel: BoundedChannel<T>) -> (Sink<T>, Option<BoundedChannel<T>>) {
        let producer = channel.clone();
        let callback = move |item: Received<T>| match item {
            Received::Value(value) => {
                let _ = producer.send(value);
            }
            Received::Malformed(reason) => {
                let _ = producer.send_malformed(reason);
            }
            Received::Disconnected => producer.close(),
            Received::NotYetAvailable => {}
        };
        let watched = channel.clone();
        (Sink::new(Box::new(callback), None, Some(watched)), Some(channel))
    }
}

/// Uniform result sink stored in a pending record.
pub(crate) struct Sink<T> {
    callback: Callback<T>,
    cleanup: Option<Cleanup>,
    /// Consumer end of a channel handler
    channel: Option<BoundedChannel<T>>,
}

impl<T> Sink<T> {
    fn new(
        callback: Callback<T>,
        cleanup: Option<Cleanup>,
        channel: Option<BoundedChannel<T>>,
    ) -> Self {
        Self {
            callback,
            cleanup,
            channel,
        }
    }

    /// True once the application closed the channel it receives from.
    pub(crate) fn is_detached(&self) -> bool {
        self.channel
            .as_ref()
            .is_some_and(|channel| channel.state() == ChannelState::Closed)
    }

    pub(crate) fn deliver(&mut self, item: Received<T>) {
        (self.callback)(item);
    }

    /// Report `Disconnected`, then run the cleanup.
    pub(crate) fn close(mut self) {
        (self.callback)(Received::Disconnected);
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_default_is_fifo_256() {
        let (_, channel) = Handler::<u32>::default().into_sink();
        let channel = channel.unwrap();
        assert_eq!(channel.capacity(), 256);
        assert_eq!(channel.policy(), crate::channel::OverflowPolicy::RejectNewest);
    }

    #[test]
    fn test_channel_sink_closes_channel() {
        let (mut sink, channel) = Handler::Ring(2).into_sink();
        let channel = channel.unwrap();

        sink.deliver(Received::Value(1));
        sink.deliver(Received::Value(2));
        sink.deliver(Received::Value(3));
        sink.close();

        assert_eq!(channel.try_receive(), Received::Value(2));
        assert_eq!(channel.try_receive(), Received::Value(3));
        assert_eq!(channel.try_receive(), Received::Disconnected);
    }

    #[test]
    fn test_callback_with_drop_sees_disconnect_before_cleanup() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&events);
        let dropped = Arc::clone(&events);

        let (mut sink, channel) = Handler::callback_with_drop(
            move |item: Received<&'static str>| seen.lock().unwrap().push(format!("{:?}", item)),
            move || dropped.lock().unwrap().push("dropped".to_string()),
        )
        .into_sink();
        assert!(channel.is_none());

        sink.deliver(Received::Value("a"));
        sink.close();

        assert_eq!(
            *events.lock().unwrap(),
            vec!["Value(\"a\")", "Disconnected", "dropped"]
        );
    }

    #[test]
    fn test_plain_callback_runs_once_per_item() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let (mut sink, _) = Handler::callback(move |item: Received<u8>| {
            if item.value().is_some() {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .into_sink();

        for i in 0..5 {
            sink.deliver(Received::Value(i));
        }
        sink.close();
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_closing_the_receiver_detaches_the_sink() {
        let (sink, channel) = Handler::<u8>::Fifo(4).into_sink();
        assert!(!sink.is_detached());
        channel.unwrap().close();
        assert!(sink.is_detached());
    }
}
