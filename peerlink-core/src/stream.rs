//! Stream object behind a stream handle: one negotiated libp2p substream, split so a blocked read
//! never holds up a write on the same stream. Closing wakes both.

use std::fmt;
use std::future::Future;
use std::io;
use std::time::Duration;

use futures::io::{ReadHalf, WriteHalf};
use futures::{AsyncReadExt, AsyncWriteExt};
use libp2p::{PeerId, Stream, StreamProtocol};
use tokio::sync::{watch, Mutex};

pub struct StreamObject {
    peer: PeerId,
    protocol: StreamProtocol,
    reader: Mutex<Option<ReadHalf<Stream>>>,
    writer: Mutex<Option<WriteHalf<Stream>>>,
    closed: watch::Sender<bool>,
}

impl fmt::Debug for StreamObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamObject")
            .field("peer", &self.peer)
            .field("protocol", &self.protocol)
            .field("closed", &*self.closed.borrow())
            .finish()
    }
}

impl StreamObject {
    pub fn new(peer: PeerId, protocol: StreamProtocol, stream: Stream) -> Self {
        let (reader, writer) = stream.split();
        let (closed, _) = watch::channel(false);
        Self {
            peer,
            protocol,
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            closed,
        }
    }

    /// Remote peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Protocol the stream was negotiated under.
    pub fn protocol(&self) -> &StreamProtocol {
        &self.protocol
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// One read into `buf`. Returns bytes placed, possibly fewer than `buf.len()`; 0 means EOF.
    /// A read still pending when [`close`](Self::close) runs fails with `NotConnected`.
    pub async fn read(&self, buf: &mut [u8], deadline: Option<Duration>) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let op = async {
            let mut reader = self.reader.lock().await;
            let reader = reader.as_mut().ok_or_else(closed_error)?;
            reader.read(buf).await
        };
        tokio::select! {
            r = with_deadline(deadline, op) => r,
            _ = closed.wait_for(|c| *c) => Err(closed_error()),
        }
    }

    /// One write of `data`. Returns bytes accepted, possibly fewer than `data.len()`.
    pub async fn write(&self, data: &[u8], deadline: Option<Duration>) -> io::Result<usize> {
        let mut closed = self.closed.subscribe();
        let op = async {
            let mut writer = self.writer.lock().await;
            let writer = writer.as_mut().ok_or_else(closed_error)?;
            let n = writer.write(data).await?;
            writer.flush().await?;
            Ok(n)
        };
        tokio::select! {
            r = with_deadline(deadline, op) => r,
            _ = closed.wait_for(|c| *c) => Err(closed_error()),
        }
    }

    /// Close both directions. Pending reads and writes are woken with `NotConnected`, our side is
    /// closed and the substream is dropped. Later calls are no-ops.
    pub async fn close(&self) -> io::Result<()> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // Woken operations release the locks before these resolve.
        let reader = self.reader.lock().await.take();
        let writer = self.writer.lock().await.take();
        let result = match writer {
            Some(mut w) => w.close().await,
            None => Ok(()),
        };
        drop(reader);
        result
    }
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> io::Result<T>
where
    F: Future<Output = io::Result<T>>,
{
    match deadline {
        Some(d) => tokio::time::timeout(d, fut)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "stream operation timed out"))?,
        None => fut.await,
    }
}
