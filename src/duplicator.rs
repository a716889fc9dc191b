//! Stream Duplicator: turns one byte source into `N` independent readers
//! consumed concurrently by the fan-out stage of the pipeline.
//!
//! A single producer task pulls chunks from the source and pushes a clone
//! of each chunk into every consumer's bounded queue, waiting for all `N`
//! sends to land before pulling the next chunk. That join is the
//! backpressure: a slow or abandoned consumer stalls the whole fan-out
//! rather than letting the others run ahead and buffer unboundedly.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Per-consumer channel capacity. One outstanding unread chunk is enough to
/// decouple producer and consumer scheduling without letting either run far
/// ahead of the other.
const CHANNEL_CAPACITY: usize = 1;

pub type DuplicatedItem = Result<Bytes, Arc<anyhow::Error>>;

/// One of the `N` reader endpoints. Implements `Stream` so callers can
/// `.next()` it like any other byte stream, or use [`collect_bytes`] to
/// buffer the whole body for backends that want it as one `Bytes`.
pub struct DuplicatedReader {
    rx: mpsc::Receiver<DuplicatedItem>,
}

impl Stream for DuplicatedReader {
    type Item = DuplicatedItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Drains a reader into a single `Bytes` buffer, surfacing the first error
/// verbatim. Used by PUT paths whose backend call takes a whole body rather
/// than a stream.
pub async fn collect_bytes(mut reader: DuplicatedReader) -> anyhow::Result<Bytes> {
    let mut buf = Vec::new();
    while let Some(item) = reader.next().await {
        match item {
            Ok(chunk) => buf.extend_from_slice(&chunk),
            Err(e) => return Err(anyhow::anyhow!("{e}")),
        }
    }
    Ok(Bytes::from(buf))
}

/// Spawns the producer task and returns its handle plus `n` reader
/// endpoints. `source` yielding `None` closes every reader cleanly; an `Err`
/// item is broadcast verbatim to every reader and ends production. If any
/// reader is dropped before being fully drained, the next send to it fails
/// and the producer stops pulling from `source` — further readers that
/// haven't been dropped simply see no more items, matching cancellation of
/// one consumer aborting the whole duplication.
pub fn fanout<S>(mut source: S, n: usize) -> (JoinHandle<()>, Vec<DuplicatedReader>)
where
    S: Stream<Item = anyhow::Result<Bytes>> + Send + Unpin + 'static,
{
    let mut txs = Vec::with_capacity(n);
    let mut readers = Vec::with_capacity(n);
    for _ in 0..n {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        txs.push(tx);
        readers.push(DuplicatedReader { rx });
    }

    let handle = tokio::spawn(async move {
        loop {
            match source.next().await {
                Some(Ok(chunk)) => {
                    let sends = txs.iter().map(|tx| {
                        let tx = tx.clone();
                        let chunk = chunk.clone();
                        async move { tx.send(Ok(chunk)).await.is_ok() }
                    });
                    let all_accepted = futures::future::join_all(sends).await.into_iter().all(|ok| ok);
                    if !all_accepted {
                        return;
                    }
                }
                Some(Err(e)) => {
                    let err = Arc::new(e);
                    let sends = txs.iter().map(|tx| {
                        let tx = tx.clone();
                        let err = err.clone();
                        async move {
                            let _ = tx.send(Err(err)).await;
                        }
                    });
                    futures::future::join_all(sends).await;
                    return;
                }
                None => return,
            }
        }
    });

    (handle, readers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn byte_stream(chunks: Vec<&'static [u8]>) -> impl Stream<Item = anyhow::Result<Bytes>> + Send + Unpin {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from_static(c))))
    }

    #[tokio::test]
    async fn every_reader_sees_the_same_bytes_in_order() {
        let source = byte_stream(vec![b"abc", b"def", b"ghi"]);
        let (handle, readers) = fanout(source, 3);

        let collected = futures::future::join_all(readers.into_iter().map(collect_bytes)).await;
        handle.await.unwrap();

        for result in collected {
            assert_eq!(result.unwrap(), Bytes::from_static(b"abcdefghi"));
        }
    }

    #[tokio::test]
    async fn source_error_is_propagated_to_every_reader() {
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(anyhow::anyhow!("backend disconnected")),
        ]);
        let (handle, readers) = fanout(source, 2);

        let results = futures::future::join_all(readers.into_iter().map(collect_bytes)).await;
        handle.await.unwrap();

        for result in results {
            let err = result.unwrap_err();
            assert!(err.to_string().contains("backend disconnected"));
        }
    }

    #[tokio::test]
    async fn dropping_one_reader_halts_the_others() {
        let source = byte_stream(vec![b"a", b"b", b"c", b"d", b"e"]);
        let (handle, mut readers) = fanout(source, 2);

        let abandoned = readers.remove(0);
        drop(abandoned);

        let mut surviving = readers.remove(0);
        // The producer aborts as soon as it notices the dropped reader; the
        // survivor only ever sees a short, possibly-empty prefix.
        let mut got = Vec::new();
        while let Some(item) = surviving.next().await {
            got.push(item.unwrap());
        }
        handle.await.unwrap();
        assert!(got.len() <= 5);
    }
}
