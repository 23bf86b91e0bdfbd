//! Serialized outbound path for one channel.
//!
//! Every frame leaving a channel (control replies, pings, and the output of
//! every stream) is queued here and written by a single task that owns the
//! socket sink, so concurrent writers never interleave on the socket.

use std::fmt::Display;

use axum::extract::ws::Message;
use futures_util::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::frame::Frame;
use crate::mux::ChannelError;
use crate::observability::metrics;

/// Cloneable handle that enqueues frames for the writer task.
#[derive(Debug, Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Frame>,
}

impl FrameSink {
    /// Create a sink and the receiving end its writer task drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Queue one frame. Waits when the queue is full.
    pub async fn write(&self, frame: Frame) -> Result<(), ChannelError> {
        let kind = frame.payload.kind();
        self.tx.send(frame).await.map_err(|_| ChannelError::Closed)?;
        metrics::record_frame("out", kind);
        Ok(())
    }
}

/// Spawn the task that owns `sink` and writes queued frames in order.
///
/// The task stops when `token` is cancelled, when every [`FrameSink`] is
/// dropped, or on the first socket error (which also cancels `token`).
pub fn spawn_writer<W>(
    sink: W,
    mut rx: mpsc::Receiver<Frame>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    W: Sink<Message> + Send + 'static,
    W::Error: Display,
{
    tokio::spawn(async move {
        let mut sink = Box::pin(sink);
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => match frame {
                    Some(f) => f,
                    None => break,
                },
                _ = token.cancelled() => break,
            };
            tracing::trace!(stream_id = frame.stream_id, kind = frame.payload.kind(), "Writing frame");
            if let Err(e) = sink.send(Message::Binary(frame.encode())).await {
                tracing::debug!(error = %e, "Socket write failed, closing channel");
                token.cancel();
                break;
            }
        }
        if let Err(e) = sink.close().await {
            tracing::trace!(error = %e, "Socket close failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::sink;

    #[tokio::test]
    async fn test_frames_written_in_queue_order() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let socket = sink::unfold(out_tx, |tx, msg: Message| async move {
            tx.send(msg).map_err(|_| "receiver gone")?;
            Ok::<_, &str>(tx)
        });

        let token = CancellationToken::new();
        let (frames, rx) = FrameSink::channel(4);
        let task = spawn_writer(socket, rx, token.clone());

        let a = frames.clone();
        let b = frames.clone();
        a.write(Frame::body(1, b"one".to_vec(), false)).await.unwrap();
        b.write(Frame::body(2, b"two".to_vec(), false)).await.unwrap();
        a.write(Frame::complete(1)).await.unwrap();
        drop((a, b, frames));
        task.await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Message::Binary(data)) = out_rx.try_recv() {
            seen.push(Frame::decode(&data).unwrap());
        }
        assert_eq!(
            seen,
            vec![
                Frame::body(1, b"one".to_vec(), false),
                Frame::body(2, b"two".to_vec(), false),
                Frame::complete(1),
            ]
        );
    }

    #[tokio::test]
    async fn test_write_after_shutdown_fails() {
        let token = CancellationToken::new();
        let (frames, rx) = FrameSink::channel(1);
        let socket = sink::drain::<Message>();
        let task = spawn_writer(socket, rx, token.clone());
        token.cancel();
        task.await.unwrap();
        assert!(matches!(frames.write(Frame::complete(1)).await, Err(ChannelError::Closed)));
    }
}
