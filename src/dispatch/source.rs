//! Readiness sources: descriptor event registrations on a serial queue.
//!
//! An [`EventSource`] watches one direction of one descriptor and invokes
//! its handler on the owning queue's thread whenever the kernel reports
//! readiness. Sources are created suspended; they follow the dispatch
//! discipline of balanced resume/suspend, one-shot re-arming after each
//! delivery, and an exactly-once cancel completion.
//!
//! Each source registers a private dup of the descriptor, so the read and
//! write sources of one socket are independent epoll entries and the
//! socket's own descriptor can be closed separately.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};

use super::queue::{QueueShared, SerialQueue};

/// Which readiness direction a source watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// Readable bytes (or pending accepts on a listener)
    Read,
    /// Writable space in the kernel send buffer
    Write,
}

/// Handler invoked on the queue with the source's data hint.
type EventHandler = Arc<dyn Fn(u64) + Send + Sync>;

/// Handler invoked exactly once after cancellation completes.
type CancelHandler = Box<dyn FnOnce() + Send>;

struct SourceState {
    /// Balanced suspension depth; sources are born with depth 1
    suspend_count: u32,
    cancelled: bool,
    /// The cancel completion has been queued (or performed)
    cancel_scheduled: bool,
    /// The dup and its epoll registration have been released
    fd_released: bool,
    handler: Option<EventHandler>,
    cancel_handler: Option<CancelHandler>,
}

/// Readiness source bound to a serial queue.
///
/// The event handler receives a data hint: readable byte count for a read
/// source, pending-connection count for a listener's read source, and an
/// estimate of free kernel send-buffer space for a write source. A hint
/// of zero on a stream read source means the peer shut down.
///
/// # Cancellation
///
/// `cancel` is idempotent. The cancel completion (epoll deregistration,
/// descriptor release, then the cancel handler) runs on the queue, and a
/// source cancelled while suspended holds the completion back until it is
/// resumed — callers that suspend a source must resume it before or while
/// cancelling, or the completion never fires.
pub struct EventSource {
    shared: Arc<SourceShared>,
}

pub(crate) struct SourceShared {
    /// Private dup of the watched descriptor
    fd: RawFd,
    interest: Interest,
    /// Read source on a listening socket: hint is the accept backlog
    listening: bool,
    token: u64,
    queue: Weak<QueueShared>,
    state: Mutex<SourceState>,
}

impl EventSource {
    /// Registers a dup of `fd` on `queue`, disarmed and suspended.
    pub(crate) fn new(
        fd: RawFd,
        interest: Interest,
        listening: bool,
        queue: &SerialQueue,
    ) -> Result<Self> {
        // SAFETY: fd is a live descriptor owned by the caller.
        let dup = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0) };
        if dup == -1 {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        let queue_shared = queue.shared();
        let token = queue_shared.allocate_token();
        let shared = Arc::new(SourceShared {
            fd: dup,
            interest,
            listening,
            token,
            queue: Arc::downgrade(queue_shared),
            state: Mutex::new(SourceState {
                suspend_count: 1,
                cancelled: false,
                cancel_scheduled: false,
                fd_released: false,
                handler: None,
                cancel_handler: None,
            }),
        });

        if let Err(e) = queue_shared.epoll_add(dup, token) {
            // SAFETY: dup is ours and was never registered.
            unsafe { libc::close(dup) };
            return Err(Error::Io(e));
        }
        queue_shared.register_source(token, &shared);

        Ok(Self { shared })
    }

    /// Installs the event handler. Must happen before the first resume.
    pub fn set_event_handler(&self, handler: impl Fn(u64) + Send + Sync + 'static) {
        self.shared.state.lock().unwrap().handler = Some(Arc::new(handler));
    }

    /// Installs the cancel handler. Must happen before cancellation.
    pub fn set_cancel_handler(&self, handler: impl FnOnce() + Send + 'static) {
        self.shared.state.lock().unwrap().cancel_handler = Some(Box::new(handler));
    }

    /// Decrements the suspension depth, arming the source at zero.
    ///
    /// Resuming an already-cancelled source releases its held cancel
    /// completion instead of arming.
    pub fn resume(&self) {
        SourceShared::resume(&self.shared);
    }

    /// Increments the suspension depth, disarming the source at one.
    pub fn suspend(&self) {
        self.shared.suspend();
    }

    /// Cancels the source. Idempotent.
    pub fn cancel(&self) {
        SourceShared::cancel(&self.shared);
    }

    /// Whether `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.shared.state.lock().unwrap().cancelled
    }
}

impl Drop for EventSource {
    fn drop(&mut self) {
        // Nobody is left to resume a suspended source, so force the
        // completion through regardless of suspension depth.
        let mut state = self.shared.state.lock().unwrap();
        state.cancelled = true;
        SourceShared::schedule_cancel(&self.shared, &mut state);
    }
}

impl std::fmt::Debug for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSource")
            .field("interest", &self.shared.interest)
            .field("listening", &self.shared.listening)
            .finish()
    }
}

impl SourceShared {
    fn resume(this: &Arc<Self>) {
        let mut state = this.state.lock().unwrap();
        debug_assert!(state.suspend_count > 0, "unbalanced resume");
        if state.suspend_count == 0 {
            return;
        }
        state.suspend_count -= 1;
        if state.suspend_count > 0 {
            return;
        }
        if state.cancelled {
            Self::schedule_cancel(this, &mut state);
        } else if !state.fd_released {
            drop(state);
            this.arm();
        }
    }

    fn suspend(&self) {
        let mut state = self.state.lock().unwrap();
        state.suspend_count += 1;
        if state.suspend_count == 1 && !state.cancelled && !state.fd_released {
            drop(state);
            self.disarm();
        }
    }

    fn cancel(this: &Arc<Self>) {
        let mut state = this.state.lock().unwrap();
        if state.cancelled {
            return;
        }
        state.cancelled = true;
        if state.suspend_count == 0 {
            Self::schedule_cancel(this, &mut state);
        }
        // A suspended source holds its completion until resumed.
    }

    /// Queues the exactly-once cancel completion.
    fn schedule_cancel(this: &Arc<Self>, state: &mut SourceState) {
        if state.cancel_scheduled {
            return;
        }
        state.cancel_scheduled = true;
        let handler = state.cancel_handler.take();

        match this.queue.upgrade() {
            Some(queue) => {
                let source = Arc::clone(this);
                queue.post(Box::new(move || {
                    source.release_registration();
                    if let Some(handler) = handler {
                        handler();
                    }
                }));
            }
            None => {
                // The queue (and its epoll set) are gone; only the dup is
                // left to reclaim. The handler is dropped unrun.
                if !state.fd_released {
                    state.fd_released = true;
                    // SAFETY: the dup is ours and not yet closed.
                    unsafe { libc::close(this.fd) };
                }
            }
        }
    }

    /// Removes the epoll registration and closes the dup.
    fn release_registration(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.fd_released {
                return;
            }
            state.fd_released = true;
        }
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.epoll_delete(self.fd);
            queue.forget_source(self.token);
        }
        // SAFETY: the dup is ours and released exactly once.
        unsafe { libc::close(self.fd) };
    }

    fn event_mask(&self) -> u32 {
        let base = match self.interest {
            Interest::Read => libc::EPOLLIN | libc::EPOLLRDHUP,
            Interest::Write => libc::EPOLLOUT,
        };
        (base | libc::EPOLLONESHOT) as u32
    }

    fn arm(&self) {
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.epoll_rearm(self.fd, self.event_mask(), self.token);
        }
    }

    fn disarm(&self) {
        if let Some(queue) = self.queue.upgrade() {
            let _ = queue.epoll_rearm(self.fd, 0, self.token);
        }
    }

    /// Runs on the queue thread for each kernel-reported event.
    pub(crate) fn deliver(self: &Arc<Self>, events: u32) {
        let handler = {
            let state = self.state.lock().unwrap();
            if state.cancelled || state.suspend_count > 0 || state.fd_released {
                return;
            }
            state.handler.clone()
        };

        let data = self.event_data(events);
        if let Some(handler) = handler {
            handler(data);
        }

        // One-shot delivery disarmed the registration; keep the event
        // stream flowing unless the handler suspended or cancelled us.
        let state = self.state.lock().unwrap();
        if !state.cancelled && state.suspend_count == 0 && !state.fd_released {
            drop(state);
            self.arm();
        }
    }

    /// Computes the data hint for a delivery.
    fn event_data(&self, _events: u32) -> u64 {
        match self.interest {
            Interest::Read if self.listening => self.pending_accepts(),
            Interest::Read => self.readable_bytes(),
            Interest::Write => self.send_space(),
        }
    }

    /// Bytes ready on a stream descriptor; zero at end-of-stream.
    fn readable_bytes(&self) -> u64 {
        let mut ready: libc::c_int = 0;
        // SAFETY: FIONREAD writes a c_int through the provided pointer.
        let rc = unsafe { libc::ioctl(self.fd, libc::FIONREAD, &mut ready) };
        if rc == 0 && ready > 0 {
            ready as u64
        } else {
            0
        }
    }

    /// Number of connections waiting in the accept backlog.
    fn pending_accepts(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            // On a listening socket tcpi_unacked counts not-yet-accepted
            // connections. A stale or failed query degrades to 1; the
            // one-shot re-arm picks up whatever remains.
            let mut info: libc::tcp_info = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::tcp_info>() as libc::socklen_t;
            // SAFETY: the kernel writes at most `len` bytes into `info`.
            let rc = unsafe {
                libc::getsockopt(
                    self.fd,
                    libc::IPPROTO_TCP,
                    libc::TCP_INFO,
                    &mut info as *mut libc::tcp_info as *mut libc::c_void,
                    &mut len,
                )
            };
            if rc == 0 && info.tcpi_unacked > 0 {
                return info.tcpi_unacked as u64;
            }
        }
        1
    }

    /// Estimate of free kernel send-buffer space; at least 1 on a
    /// writable wakeup.
    fn send_space(&self) -> u64 {
        let mut sndbuf: libc::c_int = 0;
        let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        // SAFETY: the kernel writes a c_int through the provided pointer.
        let rc = unsafe {
            libc::getsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &mut sndbuf as *mut libc::c_int as *mut libc::c_void,
                &mut len,
            )
        };
        if rc != 0 {
            return 1;
        }

        let mut queued: libc::c_int = 0;
        #[cfg(target_os = "linux")]
        // SAFETY: TIOCOUTQ writes a c_int through the provided pointer.
        unsafe {
            libc::ioctl(self.fd, libc::TIOCOUTQ, &mut queued);
        }

        (sndbuf - queued).max(1) as u64
    }
}

impl Drop for SourceShared {
    fn drop(&mut self) {
        // Last resort for a completion that never ran (queue torn down
        // with the task still queued).
        let state = self.state.get_mut().unwrap();
        if !state.fd_released {
            state.fd_released = true;
            // SAFETY: the dup is ours and not yet closed.
            unsafe { libc::close(self.fd) };
        }
    }
}
