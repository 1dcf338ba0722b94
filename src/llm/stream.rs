use super::{ChatChoice, ChatError, TokenUsage};
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tokio_util::task::TaskTracker;

const CHANNEL_CAPACITY: usize = 32;

/// One item of a streamed chat completion.
///
/// A well-formed stream ends with either `Usage` followed by `Done`, or a
/// single `Error`.
#[derive(Debug)]
pub enum StreamEvent {
    Partial(Vec<ChatChoice>),
    Usage(TokenUsage),
    Done,
    Error(ChatError),
}

/// Producer half handed to the task that drives a vendor stream.
pub struct StreamSink {
    tx: mpsc::Sender<StreamEvent>,
}

impl StreamSink {
    /// Forward a chunk. Returns `false` once the consumer is gone.
    pub async fn partial(&self, choices: Vec<ChatChoice>) -> bool {
        self.tx.send(StreamEvent::Partial(choices)).await.is_ok()
    }

    pub async fn finish(self, usage: TokenUsage) {
        if self.tx.send(StreamEvent::Usage(usage)).await.is_ok() {
            let _ = self.tx.send(StreamEvent::Done).await;
        }
    }

    pub async fn fail(self, error: ChatError) {
        let _ = self.tx.send(StreamEvent::Error(error)).await;
    }

    /// Terminate after cancellation without waiting on a stalled consumer.
    pub fn cancelled(self) {
        let _ = self.tx.try_send(StreamEvent::Error(ChatError::Cancelled));
    }
}

/// Consumer handle for a streamed completion.
///
/// Dropping the handle cancels the producer task, which in turn drops the
/// underlying vendor stream.
pub struct ChatStream {
    rx: mpsc::Receiver<StreamEvent>,
    _guard: DropGuard,
}

impl ChatStream {
    /// Spawn `producer` and return the handle that reads from it.
    pub fn spawn<F, Fut>(cancel: CancellationToken, producer: F) -> Self
    where
        F: FnOnce(StreamSink, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(producer(StreamSink { tx }, cancel.clone()));
        Self::with_receiver(rx, cancel)
    }

    /// Like [`ChatStream::spawn`], but the producer counts toward `tracker`.
    pub fn spawn_tracked<F, Fut>(tracker: &TaskTracker, cancel: CancellationToken, producer: F) -> Self
    where
        F: FnOnce(StreamSink, CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tracker.spawn(producer(StreamSink { tx }, cancel.clone()));
        Self::with_receiver(rx, cancel)
    }

    fn with_receiver(rx: mpsc::Receiver<StreamEvent>, cancel: CancellationToken) -> Self {
        Self {
            rx,
            _guard: cancel.drop_guard(),
        }
    }

    /// A finished stream replaying `events`, used for cache hits.
    pub fn from_events(events: Vec<StreamEvent>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            let _ = tx.try_send(event);
        }
        Self::with_receiver(rx, CancellationToken::new())
    }

    pub async fn next_event(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn choice(text: &str) -> Vec<ChatChoice> {
        vec![ChatChoice {
            index: 0,
            role: "assistant".to_string(),
            content: text.to_string(),
        }]
    }

    #[tokio::test]
    async fn test_stream_ends_with_usage_then_done() {
        let stream = ChatStream::spawn(CancellationToken::new(), |sink, _cancel| async move {
            sink.partial(choice("Hel")).await;
            sink.partial(choice("lo")).await;
            sink.finish(TokenUsage::new(3, 2)).await;
        });

        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(events.len(), 4);
        assert!(matches!(events[2], StreamEvent::Usage(u) if u.total == 5));
        assert!(matches!(events[3], StreamEvent::Done));
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_producer() {
        let observed = Arc::new(AtomicBool::new(false));
        let flag = observed.clone();

        let stream = ChatStream::spawn(CancellationToken::new(), move |sink, cancel| async move {
            tokio::select! {
                _ = cancel.cancelled() => flag.store(true, Ordering::SeqCst),
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    sink.finish(TokenUsage::default()).await;
                }
            }
        });
        drop(stream);

        for _ in 0..50 {
            if observed.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(observed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_from_events_replays() {
        let mut stream = ChatStream::from_events(vec![
            StreamEvent::Partial(choice("cached")),
            StreamEvent::Usage(TokenUsage::new(1, 1)),
            StreamEvent::Done,
        ]);

        assert!(matches!(stream.next_event().await, Some(StreamEvent::Partial(_))));
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Usage(_))));
        assert!(matches!(stream.next_event().await, Some(StreamEvent::Done)));
        assert!(stream.next_event().await.is_none());
    }
}
