//! Outgoing half of the stream.
//!
//! Every write goes through one mutex. A stanza is serialized in full before
//! the lock is taken and written with a single `write_all` while it is held,
//! so stanzas from concurrent tasks never interleave on the wire.

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::trace;
use xwh_core::{Delivery, Element, XwhError, XwhResult};

use crate::relay::DeliverySink;

pub struct StanzaWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> StanzaWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }

    pub async fn send(&self, stanza: &Element) -> XwhResult<()> {
        let xml = stanza.to_xml();
        trace!(stanza = stanza.name(), bytes = xml.len(), "sending stanza");
        self.write_raw(&xml).await
    }

    pub async fn write_raw(&self, data: &str) -> XwhResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .write_all(data.as_bytes())
            .await
            .map_err(|e| XwhError::Transport(format!("write failed: {e}")))?;
        inner
            .flush()
            .await
            .map_err(|e| XwhError::Transport(format!("flush failed: {e}")))?;
        Ok(())
    }

    pub async fn shutdown(&self) -> XwhResult<()> {
        self.inner.lock().await.shutdown().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> DeliverySink for StanzaWriter<W> {
    async fn deliver(&self, delivery: &Delivery) -> XwhResult<()> {
        self.send(&delivery.to_stanza()).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use xwh_core::Jid;

    /// Accepts a few bytes per call and yields to the scheduler in between,
    /// so unsynchronized writers would interleave.
    #[derive(Clone, Default)]
    pub(crate) struct ChunkedWriter {
        pub(crate) written: Arc<std::sync::Mutex<Vec<u8>>>,
        ready: bool,
    }

    impl ChunkedWriter {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.written.lock().unwrap().clone()).unwrap()
        }
    }

    impl AsyncWrite for ChunkedWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            if !self.ready {
                self.ready = true;
                cx.waker().wake_by_ref();
                return Poll::Pending;
            }
            self.ready = false;
            let n = buf.len().min(3);
            self.written.lock().unwrap().extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Split captured output into top-level `<message>` elements.
    pub(crate) fn parse_messages(output: &str) -> Vec<Element> {
        output
            .split_inclusive("</message>")
            .map(|chunk| Element::parse(chunk).expect("stanza was corrupted"))
            .collect()
    }

    #[tokio::test]
    async fn concurrent_deliveries_do_not_interleave() {
        let out = ChunkedWriter::default();
        let writer = Arc::new(StanzaWriter::new(out.clone()));
        let from = Jid::parse("relay@example.org").unwrap();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let writer = writer.clone();
            let from = from.clone();
            tasks.push(tokio::spawn(async move {
                let to = Jid::parse(&format!("user{i}@example.org")).unwrap();
                let text = format!("alert number {i} with a reasonably long body");
                writer.deliver(&Delivery::new(from, to, text)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let messages = parse_messages(&out.contents());
        assert_eq!(messages.len(), 16);
        let mut bodies: Vec<String> = messages
            .iter()
            .map(|m| m.child("body").unwrap().text())
            .collect();
        bodies.sort();
        let mut expected: Vec<String> = (0..16)
            .map(|i| format!("alert number {i} with a reasonably long body"))
            .collect();
        expected.sort();
        assert_eq!(bodies, expected);
        for m in &messages {
            let to = m.attr("to").unwrap();
            let n = to.trim_start_matches("user").trim_end_matches("@example.org");
            assert!(m.child("body").unwrap().text().contains(&format!("number {n} ")));
        }
    }

    #[tokio::test]
    async fn raw_writes_pass_through() {
        let writer = StanzaWriter::new(Vec::new());
        writer.write_raw("</stream:stream>").await.unwrap();
        writer.shutdown().await.unwrap();
        assert_eq!(writer.into_inner(), b"</stream:stream>");
    }
}
