//! Serial dispatch queues and readiness sources.
//!
//! The dispatch runtime is what turns kernel readiness into ordered
//! callbacks: a [`SerialQueue`] owns one thread that interleaves an epoll
//! wait with a FIFO task list, and an [`EventSource`] is a descriptor
//! registration on that queue with resume/suspend/cancel semantics.
//! Everything an owner (server or client) and its connections mutate runs
//! on the owner's queue, which is the crate's mutual-exclusion story.

pub mod queue;
pub mod source;

pub use queue::{QueueHandle, SerialQueue};
pub use source::{EventSource, Interest};
