use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};

enum Message<T> {
    Update(T),
    Flush(T, oneshot::Sender<()>),
}

/// Trailing-edge debouncer: `push` overwrites the pending value and restarts
/// the delay; the sink sees the latest value once the stream goes quiet.
/// `flush` bypasses the delay, delivering after any pending value so terminal
/// updates are never reordered.
pub struct Debouncer<T> {
    tx: mpsc::UnboundedSender<Message<T>>,
}

impl<T: Send + 'static> Debouncer<T> {
    pub fn new(
        delay: Duration,
        sink: impl Fn(T) -> BoxFuture<'static, ()> + Send + 'static,
    ) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Message<T>>();

        tokio::spawn(async move {
            let mut pending: Option<T> = None;
            loop {
                tokio::select! {
                    message = rx.recv() => match message {
                        // A dropped handle discards the pending value: once a
                        // task is canceled nothing further may be delivered.
                        None => break,
                        Some(Message::Update(value)) => {
                            pending = Some(value);
                        }
                        Some(Message::Flush(value, done_tx)) => {
                            if let Some(value) = pending.take() {
                                sink(value).await;
                            }
                            sink(value).await;
                            _ = done_tx.send(());
                        }
                    },
                    _ = tokio::time::sleep(delay), if pending.is_some() => {
                        sink(pending.take().unwrap()).await;
                    }
                }
            }
        });

        Self { tx }
    }

    pub fn push(&self, value: T) {
        _ = self.tx.send(Message::Update(value));
    }

    /// Delivers `value` immediately, after any pending debounced value.
    pub async fn flush(&self, value: T) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Message::Flush(value, done_tx)).is_ok() {
            _ = done_rx.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use futures_util::FutureExt;

    use super::Debouncer;

    fn collecting_sink(sink: Arc<Mutex<Vec<u32>>>) -> impl Fn(u32) -> futures_util::future::BoxFuture<'static, ()> {
        move |value| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(value);
            }
            .boxed()
        }
    }

    #[tokio::test]
    async fn test_coalesces_updates() {
        let seen = Arc::new(Mutex::new(vec![]));
        let debouncer = Debouncer::new(Duration::from_millis(50), collecting_sink(seen.clone()));

        debouncer.push(1);
        debouncer.push(2);
        debouncer.push(3);
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert_eq!(*seen.lock().unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_flush_preserves_order() {
        let seen = Arc::new(Mutex::new(vec![]));
        let debouncer = Debouncer::new(Duration::from_millis(500), collecting_sink(seen.clone()));

        debouncer.push(1);
        debouncer.flush(2).await;

        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_trailing_edge_restarts() {
        let seen = Arc::new(Mutex::new(vec![]));
        let debouncer = Debouncer::new(Duration::from_millis(100), collecting_sink(seen.clone()));

        debouncer.push(1);
        tokio::time::sleep(Duration::from_millis(60)).await;
        debouncer.push(2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(seen.lock().unwrap().is_empty());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock().unwrap(), vec![2]);
    }
}
