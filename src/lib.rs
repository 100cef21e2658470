#![warn(missing_docs)]

//! Bindings and wrappers for Linux's change-notification descriptors.
//!
//! The kernel reports filesystem activity through two related facilities,
//! each delivered over a readable file descriptor with its own binary
//! record format:
//!
//! - [inotify][inotify7] reports changes to individually watched files and
//!   directories, identified by watch descriptor.
//! - [fanotify][fanotify7] reports file accesses across marked paths or
//!   whole mounts, identified by an open file descriptor per event, and
//!   can ask the caller for permission decisions.
//!
//! Both are exposed through the same event-source abstraction: a queue of
//! decoded events on top of the raw handle, with single-event reads, batch
//! reads, blocking waits with optional timeout, and infinite iteration.
//! The [`inotify`] and [`fanotify`] modules each plug their record decoder
//! into [`source::EventSource`] and add the subsystem-specific surface
//! (watch registration, marks, permission responses).
//!
//! The model is synchronous and single-threaded: the only suspension point
//! is [`source::EventSource::wait`], which blocks the calling thread until
//! the handle becomes readable. Events are delivered in the exact order
//! the kernel emitted them.
//!
//! See the man pages for usage information on the C APIs, which this
//! crate follows closely.
//!
//! [inotify7]: https://man7.org/linux/man-pages/man7/inotify.7.html
//! [fanotify7]: https://man7.org/linux/man-pages/man7/fanotify.7.html

pub mod errors;
pub mod fanotify;
pub mod ffi;
pub mod inotify;
pub mod source;

mod util;

pub use crate::errors::{Error, Result};
pub use crate::fanotify::Fanotify;
pub use crate::inotify::Inotify;
pub use crate::source::{EventDecoder, EventSource, Events};
