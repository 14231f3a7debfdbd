//! Serial FIFO task queue fused with an epoll reactor.
//!
//! A [`SerialQueue`] runs one worker thread that alternates between
//! executing posted tasks in FIFO order and waiting for readiness events
//! on registered sources. Tasks and event handlers therefore never run
//! concurrently with each other, which gives any state touched only from
//! one queue implicit mutual exclusion.
//!
//! Posting is cheap from any thread: the task lands in a locked deque and
//! an eventfd write wakes the epoll wait.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, ThreadId};

use crate::error::{Error, Result};

use super::source::SourceShared;

/// A unit of work posted to a queue.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

/// Token reserved for the wakeup eventfd.
const WAKE_TOKEN: u64 = 0;

/// Converts a syscall return value into an [`io::Result`].
fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Serial dispatch queue.
///
/// Owns the worker thread; dropping the queue asks the worker to finish
/// the pending task backlog and exit. Handles obtained through
/// [`SerialQueue::handle`] stay valid after the drop but their posts
/// become no-ops.
pub struct SerialQueue {
    shared: Arc<QueueShared>,
    worker: Option<thread::JoinHandle<()>>,
}

/// State shared between the queue handle, its worker thread and the
/// sources registered on it.
pub(crate) struct QueueShared {
    label: String,
    epoll_fd: RawFd,
    wake_fd: RawFd,
    tasks: Mutex<VecDeque<Task>>,
    sources: Mutex<HashMap<u64, Weak<SourceShared>>>,
    next_token: AtomicU64,
    quitting: AtomicBool,
    worker_thread: Mutex<Option<ThreadId>>,
}

impl SerialQueue {
    /// Creates a queue whose worker thread is named `label`.
    pub fn new(label: &str) -> Result<Self> {
        let epoll_fd = cvt(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if wake_fd == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epoll_fd) };
            return Err(Error::Io(err));
        }

        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: WAKE_TOKEN,
        };
        if unsafe { libc::epoll_ctl(epoll_fd, libc::EPOLL_CTL_ADD, wake_fd, &mut event) } == -1 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(wake_fd);
                libc::close(epoll_fd);
            }
            return Err(Error::Io(err));
        }

        let shared = Arc::new(QueueShared {
            label: label.to_string(),
            epoll_fd,
            wake_fd,
            tasks: Mutex::new(VecDeque::new()),
            sources: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(WAKE_TOKEN + 1),
            quitting: AtomicBool::new(false),
            worker_thread: Mutex::new(None),
        });

        let worker = thread::Builder::new()
            .name(label.to_string())
            .spawn({
                let shared = Arc::clone(&shared);
                move || run_loop(shared)
            })
            .map_err(Error::Io)?;

        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// The label the queue was created with.
    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Posts a task to the back of the queue.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) {
        self.shared.post(Box::new(task));
    }

    /// Returns a weak, cloneable posting handle.
    pub fn handle(&self) -> QueueHandle {
        QueueHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Whether the calling thread is the queue's worker thread.
    pub fn is_current(&self) -> bool {
        self.shared.is_current()
    }

    pub(crate) fn shared(&self) -> &Arc<QueueShared> {
        &self.shared
    }
}

impl Drop for SerialQueue {
    fn drop(&mut self) {
        self.shared.quitting.store(true, Ordering::Release);
        self.shared.wake();
        if let Some(worker) = self.worker.take() {
            // A queue can be dropped from one of its own tasks; the
            // worker cannot join itself, so it is left to unwind alone.
            if thread::current().id() != worker.thread().id() {
                let _ = worker.join();
            }
        }
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.shared.label)
            .finish()
    }
}

/// Cheap posting handle onto a [`SerialQueue`].
///
/// Holds no ownership: posting to a queue that has been dropped is a
/// silent no-op that reports `false`.
#[derive(Clone)]
pub struct QueueHandle {
    shared: Weak<QueueShared>,
}

impl QueueHandle {
    /// Posts a task; returns whether the queue was still alive.
    pub fn post(&self, task: impl FnOnce() + Send + 'static) -> bool {
        match self.shared.upgrade() {
            Some(shared) => {
                shared.post(Box::new(task));
                true
            }
            None => false,
        }
    }

    /// Whether the calling thread is the queue's worker thread.
    pub fn is_current(&self) -> bool {
        self.shared
            .upgrade()
            .map(|shared| shared.is_current())
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueHandle").finish()
    }
}

impl QueueShared {
    pub(crate) fn post(&self, task: Task) {
        self.tasks.lock().unwrap().push_back(task);
        self.wake();
    }

    fn wake(&self) {
        let one: u64 = 1;
        // SAFETY: wake_fd is our eventfd; an eventfd write takes exactly
        // 8 bytes. A full counter means a wakeup is already pending.
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn drain_wake(&self) {
        let mut counter: u64 = 0;
        // SAFETY: wake_fd is our non-blocking eventfd; reading resets it.
        unsafe {
            libc::read(
                self.wake_fd,
                &mut counter as *mut u64 as *mut libc::c_void,
                8,
            );
        }
    }

    fn run_pending_tasks(&self) {
        loop {
            let task = self.tasks.lock().unwrap().pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }
    }

    pub(crate) fn is_current(&self) -> bool {
        *self.worker_thread.lock().unwrap() == Some(thread::current().id())
    }

    pub(crate) fn allocate_token(&self) -> u64 {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register_source(&self, token: u64, source: &Arc<SourceShared>) {
        self.sources
            .lock()
            .unwrap()
            .insert(token, Arc::downgrade(source));
    }

    pub(crate) fn forget_source(&self, token: u64) {
        self.sources.lock().unwrap().remove(&token);
    }

    /// Adds `fd` to the epoll set, disarmed.
    pub(crate) fn epoll_add(&self, fd: RawFd, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event {
            events: 0,
            u64: token,
        };
        // SAFETY: both descriptors are valid for the duration of the call.
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_ADD, fd, &mut event) })
            .map(drop)
    }

    /// Rearms (or disarms, with an empty mask) an already-added fd.
    pub(crate) fn epoll_rearm(&self, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: both descriptors are valid for the duration of the call.
        cvt(unsafe { libc::epoll_ctl(self.epoll_fd, libc::EPOLL_CTL_MOD, fd, &mut event) })
            .map(drop)
    }

    /// Removes an fd from the epoll set.
    pub(crate) fn epoll_delete(&self, fd: RawFd) -> io::Result<()> {
        // SAFETY: with EPOLL_CTL_DEL the event pointer is not read.
        cvt(unsafe {
            libc::epoll_ctl(
                self.epoll_fd,
                libc::EPOLL_CTL_DEL,
                fd,
                std::ptr::null_mut(),
            )
        })
        .map(drop)
    }
}

impl Drop for QueueShared {
    fn drop(&mut self) {
        // SAFETY: both fds belong to this queue and are closed exactly here.
        unsafe {
            libc::close(self.wake_fd);
            libc::close(self.epoll_fd);
        }
    }
}

fn run_loop(shared: Arc<QueueShared>) {
    *shared.worker_thread.lock().unwrap() = Some(thread::current().id());

    let mut events: Vec<libc::epoll_event> =
        vec![libc::epoll_event { events: 0, u64: 0 }; 64];

    loop {
        shared.run_pending_tasks();
        if shared.quitting.load(Ordering::Acquire) {
            break;
        }

        // SAFETY: the buffer outlives the call and its length is passed.
        let n = unsafe {
            libc::epoll_wait(
                shared.epoll_fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                -1,
            )
        };
        if n == -1 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            break;
        }

        for event in &events[..n as usize] {
            let event_u64 = event.u64;
            let event_events = event.events;
            if event_u64 == WAKE_TOKEN {
                shared.drain_wake();
                continue;
            }
            let source = {
                let sources = shared.sources.lock().unwrap();
                sources.get(&event_u64).and_then(Weak::upgrade)
            };
            if let Some(source) = source {
                source.deliver(event_events);
            }
        }
    }

    // Tasks posted between the quit flag and the wakeup still run.
    shared.run_pending_tasks();
}
