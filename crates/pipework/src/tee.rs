//! Bounded byte fan-out for pipeline streams.
//!
//! A tee splits one byte stream into N independently-paced readable views.
//! The source is written once; every view observes the identical byte
//! sequence. Per-view buffering is bounded, so the writer advances only as
//! fast as the slowest still-open view consumes — backpressure instead of
//! unbounded memory growth or data loss.
//!
//! ```text
//!                       ┌──▶ [VecDeque<u8>] ──▶ TeeView 0
//!   TeeSink ──(write)───┼──▶ [VecDeque<u8>] ──▶ TeeView 1
//!                       └──▶ [VecDeque<u8>] ──▶ TeeView 2
//!                  ├── writer blocks while any open view is full
//!                  ├── a view blocks while its buffer is empty
//!                  ├── drop sink → EOF for every view
//!                  └── drop a view → its slot discards further bytes
//! ```
//!
//! Implementation uses `std::sync::Mutex` (not tokio) since critical sections
//! are just VecDeque operations. The writer-closed flag is an `AtomicBool` so
//! Drop is always synchronous. Wakers are stored under the lock to prevent
//! lost wakeups.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Default per-view buffer capacity (matches Linux kernel pipe default).
pub const TEE_BUFFER_SIZE: usize = 64 * 1024;

/// One view's slot: its private ring buffer plus reader bookkeeping.
struct ViewSlot {
    buffer: VecDeque<u8>,
    /// Reader has been dropped; the slot accepts and discards further bytes.
    closed: bool,
    /// Waker for the view's reader task (set when it finds an empty buffer).
    reader_waker: Option<Waker>,
}

/// Shared mutable state protected by std::sync::Mutex.
struct TeeState {
    views: Vec<ViewSlot>,
    capacity: usize,
    /// Waker for the writer task (set when some open view is full).
    writer_waker: Option<Waker>,
}

struct TeeShared {
    state: Mutex<TeeState>,
    /// Writer has been dropped or shut down (EOF). Atomic so Drop is lock-free.
    writer_closed: AtomicBool,
}

/// Writing end of a tee. One per tee; usually fed by a [`Pump`].
///
/// [`Pump`]: crate::pump::Pump
pub struct TeeSink {
    shared: Arc<TeeShared>,
}

/// One independently-paced readable view of the teed stream.
///
/// Reads block until bytes are available or the sink reaches EOF, at which
/// point the view yields EOF exactly once and stays exhausted. Reads of any
/// chunk size are fine, including 1-byte reads across frame boundaries.
pub struct TeeView {
    shared: Arc<TeeShared>,
    slot: usize,
}

/// Create a tee with `views` output views and the given per-view capacity.
///
/// `views` may be zero, in which case the sink accepts and discards
/// everything written to it.
pub fn tee(views: usize, capacity: usize) -> (TeeSink, Vec<TeeView>) {
    let slots = (0..views)
        .map(|_| ViewSlot {
            buffer: VecDeque::with_capacity(capacity.min(8192)),
            closed: false,
            reader_waker: None,
        })
        .collect();

    let shared = Arc::new(TeeShared {
        state: Mutex::new(TeeState {
            views: slots,
            capacity,
            writer_waker: None,
        }),
        writer_closed: AtomicBool::new(false),
    });

    let readers = (0..views)
        .map(|slot| TeeView {
            shared: shared.clone(),
            slot,
        })
        .collect();

    (TeeSink { shared }, readers)
}

impl TeeSink {
    fn poll_write_impl(&self, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let capacity = state.capacity;

        // Grant is bounded by the fullest open view; closed views don't count.
        let mut grant = usize::MAX;
        let mut any_open = false;
        for view in &state.views {
            if view.closed {
                continue;
            }
            any_open = true;
            grant = grant.min(capacity - view.buffer.len());
        }

        // Every consumer is gone (or there were none): discard.
        if !any_open {
            return Poll::Ready(Ok(buf.len()));
        }

        if grant == 0 {
            // Some open view is full — park until a reader frees space.
            state.writer_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = grant.min(buf.len());
        for view in state.views.iter_mut() {
            if view.closed {
                continue;
            }
            view.buffer.extend(&buf[..n]);
            if let Some(waker) = view.reader_waker.take() {
                waker.wake();
            }
        }
        Poll::Ready(Ok(n))
    }

    fn close(&self) {
        self.shared.writer_closed.store(true, Ordering::Release);
        if let Ok(mut state) = self.shared.state.lock() {
            for view in state.views.iter_mut() {
                if let Some(waker) = view.reader_waker.take() {
                    waker.wake();
                }
            }
        }
        // If the lock is poisoned, readers will see writer_closed on next poll.
    }
}

impl AsyncWrite for TeeSink {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.poll_write_impl(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TeeSink {
    fn drop(&mut self) {
        self.close();
    }
}

impl AsyncRead for TeeView {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *state;
        let slot = &mut state.views[self.slot];

        if !slot.buffer.is_empty() {
            let to_read = buf.remaining().min(slot.buffer.len());
            let (front, back) = slot.buffer.as_slices();

            if to_read <= front.len() {
                buf.put_slice(&front[..to_read]);
            } else {
                buf.put_slice(front);
                let remaining = to_read - front.len();
                buf.put_slice(&back[..remaining]);
            }

            slot.buffer.drain(..to_read);
            // This view may have been the bottleneck — wake the writer.
            if let Some(waker) = state.writer_waker.take() {
                waker.wake();
            }
            Poll::Ready(Ok(()))
        } else if self.shared.writer_closed.load(Ordering::Acquire) {
            // EOF — writer is gone and this view's buffer is drained.
            Poll::Ready(Ok(()))
        } else {
            slot.reader_waker = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

impl Drop for TeeView {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            let slot = &mut state.views[self.slot];
            slot.closed = true;
            slot.buffer.clear();
            if let Some(waker) = state.writer_waker.take() {
                waker.wake();
            }
        }
    }
}

impl std::fmt::Debug for TeeSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeSink").finish()
    }
}

impl std::fmt::Debug for TeeView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeeView").field("slot", &self.slot).finish()
    }
}
