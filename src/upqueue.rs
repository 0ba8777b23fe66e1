//! Per-device FIFO of serialized messages flowing from the stack to user
//! space. The queue is bounded by a byte budget; appenders may wait a short
//! while for space, readers pop exactly one message per call.
use crate::err::{Error, Result};
use bytes::BytesMut;
use futures_timer::Delay;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

/// Byte budget of one upqueue.
pub const UPQUEUE_SIZE_MAX: usize = 1 << 14;
/// Accounting overhead charged per queued message.
const ENTRY_OVERHEAD: usize = 32;
/// How long a sleeping appender waits for space before dropping.
const APPEND_TIMEOUT: Duration = Duration::from_millis(5);

struct Inner {
    q: VecDeque<BytesMut>,
    size: usize,
    read_wakers: Vec<Waker>,
    write_wakers: Vec<Waker>,
}

impl Inner {
    fn try_push(&mut self, msg: &mut Option<BytesMut>) -> bool {
        let len = msg.as_ref().map(|m| m.len()).unwrap_or(0) + ENTRY_OVERHEAD;
        if self.size + len > UPQUEUE_SIZE_MAX {
            return false;
        }
        self.q.push_back(msg.take().unwrap());
        self.size += len;
        true
    }

    fn wake_readers(&mut self) {
        for w in self.read_wakers.drain(..) {
            w.wake();
        }
    }

    fn wake_writers(&mut self) {
        for w in self.write_wakers.drain(..) {
            w.wake();
        }
    }
}

/// Bounded FIFO of serialized messages.
pub struct Upqueue {
    inner: Mutex<Inner>,
}

impl Upqueue {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                q: VecDeque::new(),
                size: 0,
                read_wakers: Vec::new(),
                write_wakers: Vec::new(),
            }),
        }
    }

    /// Appends without waiting; `NoSpace` when the budget is exceeded.
    pub fn append_nowait(&self, msg: BytesMut) -> Result<()> {
        let mut msg = Some(msg);
        let mut inner = self.inner.lock().unwrap();
        if inner.try_push(&mut msg) {
            inner.wake_readers();
            Ok(())
        } else {
            log::debug!("upqueue overrun, dropping [cansleep=0]");
            Err(Error::NoSpace)
        }
    }

    /// Appends, waiting up to the append budget for space; then drops the
    /// message with `NoSpace`.
    pub async fn append(&self, msg: BytesMut) -> Result<()> {
        Append {
            uq: self,
            msg: Some(msg),
            timeout: Delay::new(APPEND_TIMEOUT),
        }
        .await
    }

    /// Pops one message into `buf` without waiting.
    ///
    /// `Ok(None)` when the queue is empty; `NoBufs` without consuming when
    /// `buf` is smaller than the head message.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let mut inner = self.inner.lock().unwrap();
        let head_len = match inner.q.front() {
            Some(head) => head.len(),
            None => return Ok(None),
        };
        if buf.len() < head_len {
            return Err(Error::NoBufs);
        }
        let head = inner.q.pop_front().unwrap();
        inner.size -= head.len() + ENTRY_OVERHEAD;
        buf[..head_len].copy_from_slice(&head);
        inner.wake_writers();
        Ok(Some(head_len))
    }

    /// Pops one message into `buf`, waiting for one to arrive.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        Read { uq: self, buf }.await
    }

    /// Readable when at least one message is queued.
    pub fn poll_readable(&self, cx: &mut Context) -> Poll<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.q.is_empty() {
            return Poll::Ready(());
        }
        inner.read_wakers.push(cx.waker().clone());
        Poll::Pending
    }

    /// Number of queued messages.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().q.len()
    }

    pub(crate) fn drain(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.q.clear();
        inner.size = 0;
        inner.wake_readers();
        inner.wake_writers();
    }
}

struct Append<'a> {
    uq: &'a Upqueue,
    msg: Option<BytesMut>,
    timeout: Delay,
}

impl<'a> Future for Append<'a> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        {
            let mut inner = this.uq.inner.lock().unwrap();
            if inner.try_push(&mut this.msg) {
                inner.wake_readers();
                return Poll::Ready(Ok(()));
            }
            inner.write_wakers.push(cx.waker().clone());
        }
        match Pin::new(&mut this.timeout).poll(cx) {
            Poll::Ready(()) => {
                log::debug!("upqueue overrun, dropping [cansleep=1]");
                Poll::Ready(Err(Error::NoSpace))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Read<'a> {
    uq: &'a Upqueue,
    buf: &'a mut [u8],
}

impl<'a> Future for Read<'a> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Self::Output> {
        let this = self.get_mut();
        match this.uq.try_read(this.buf) {
            Ok(Some(n)) => Poll::Ready(Ok(n)),
            Ok(None) => {
                let mut inner = this.uq.inner.lock().unwrap();
                if inner.q.is_empty() {
                    inner.read_wakers.push(cx.waker().clone());
                    return Poll::Pending;
                }
                drop(inner);
                match this.uq.try_read(this.buf) {
                    Ok(Some(n)) => Poll::Ready(Ok(n)),
                    Ok(None) => Poll::Pending,
                    Err(e) => Poll::Ready(Err(e)),
                }
            }
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_std::task;

    fn msg(len: usize) -> BytesMut {
        let mut m = BytesMut::with_capacity(len);
        m.resize(len, 0xab);
        m
    }

    #[test]
    fn test_fifo_order() {
        let uq = Upqueue::new();
        uq.append_nowait(BytesMut::from(&b"one"[..])).unwrap();
        uq.append_nowait(BytesMut::from(&b"three"[..])).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(uq.try_read(&mut buf).unwrap(), Some(3));
        assert_eq!(&buf[..3], b"one");
        assert_eq!(uq.try_read(&mut buf).unwrap(), Some(5));
        assert_eq!(&buf[..5], b"three");
        assert_eq!(uq.try_read(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_small_buffer_keeps_head() {
        let uq = Upqueue::new();
        uq.append_nowait(msg(100)).unwrap();
        let mut small = [0u8; 10];
        assert_eq!(uq.try_read(&mut small), Err(Error::NoBufs));
        let mut big = [0u8; 100];
        assert_eq!(uq.try_read(&mut big).unwrap(), Some(100));
    }

    #[test]
    fn test_saturation_drops_after_timeout() {
        task::block_on(async {
            let uq = Upqueue::new();
            while uq.append_nowait(msg(1000)).is_ok() {}
            // Queue is full; a sleeping append gives up after the budget.
            assert_eq!(uq.append(msg(1000)).await, Err(Error::NoSpace));
        });
    }

    #[test]
    fn test_blocked_appender_unblocks_on_drain() {
        task::block_on(async {
            let uq = std::sync::Arc::new(Upqueue::new());
            while uq.append_nowait(msg(4000)).is_ok() {}
            let uq2 = uq.clone();
            let reader = task::spawn(async move {
                // Give the appender time to block, then free some space.
                Delay::new(Duration::from_millis(1)).await;
                let mut buf = vec![0u8; 4096];
                uq2.try_read(&mut buf).unwrap().unwrap();
            });
            assert!(uq.append(msg(1000)).await.is_ok());
            reader.await;
        });
    }

    #[test]
    fn test_blocking_read() {
        task::block_on(async {
            let uq = std::sync::Arc::new(Upqueue::new());
            let uq2 = uq.clone();
            let writer = task::spawn(async move {
                Delay::new(Duration::from_millis(1)).await;
                uq2.append_nowait(BytesMut::from(&b"late"[..])).unwrap();
            });
            let mut buf = [0u8; 16];
            let n = uq.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"late");
            writer.await;
        });
    }
}
