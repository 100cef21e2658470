//! Wrapper for fanotify, the whole-filesystem access notification API.
//!
//! Unlike inotify, fanotify reports activity through an open file
//! descriptor per event rather than a watch identifier, and can deliver
//! permission events that the caller answers with [`Fanotify::respond`].
//! Creating an instance requires the `CAP_SYS_ADMIN` capability.
//!
//! See the [fanotify(7)] man page for the semantics of the underlying API,
//! which this module follows closely.
//!
//! [fanotify(7)]: https://man7.org/linux/man-pages/man7/fanotify.7.html

use std::ffi::CString;
use std::fs;
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::ptr;
use std::time::Duration;

use bitflags::bitflags;
use libc::c_void;

use crate::errors::{Error, Result};
use crate::ffi;
use crate::source::{EventDecoder, EventSource, Events};
use crate::util;

bitflags! {
    /// Flags for [`Fanotify::init`].
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct InitFlags: u32 {
        /// Close the handle automatically on exec().
        const CLOEXEC = ffi::FAN_CLOEXEC;

        /// Put the handle in non-blocking mode.
        const NONBLOCK = ffi::FAN_NONBLOCK;

        /// Receive plain notification events only (the default class).
        const CLASS_NOTIF = ffi::FAN_CLASS_NOTIF;

        /// Receive permission events after files contain their final
        /// content.
        const CLASS_CONTENT = ffi::FAN_CLASS_CONTENT;

        /// Receive permission events before files contain their final
        /// content.
        const CLASS_PRE_CONTENT = ffi::FAN_CLASS_PRE_CONTENT;

        /// Lift the limit on the length of the event queue.
        const UNLIMITED_QUEUE = ffi::FAN_UNLIMITED_QUEUE;

        /// Lift the limit on the number of marks.
        const UNLIMITED_MARKS = ffi::FAN_UNLIMITED_MARKS;
    }
}

bitflags! {
    /// File status flags for the descriptors the kernel opens on the
    /// caller's behalf, one per delivered event.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct EventFlags: u32 {
        /// Open the event descriptors read-only.
        const RDONLY = libc::O_RDONLY as u32;

        /// Open the event descriptors write-only.
        const WRONLY = libc::O_WRONLY as u32;

        /// Open the event descriptors for reading and writing.
        const RDWR = libc::O_RDWR as u32;

        /// Allow the event descriptors to refer to files over 2 GiB.
        const LARGEFILE = libc::O_LARGEFILE as u32;

        /// Close the event descriptors automatically on exec().
        const CLOEXEC = libc::O_CLOEXEC as u32;

        /// Open the event descriptors in non-blocking mode.
        const NONBLOCK = libc::O_NONBLOCK as u32;
    }
}

bitflags! {
    /// Flags controlling how a mark is added or removed.
    ///
    /// [`Fanotify::watch`] and [`Fanotify::ignore`] fill in `ADD` and
    /// `REMOVE`; the remaining flags qualify what the mark applies to.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct MarkFlags: u32 {
        /// Add the events in the mask to the mark.
        const ADD = ffi::FAN_MARK_ADD;

        /// Remove the events in the mask from the mark.
        const REMOVE = ffi::FAN_MARK_REMOVE;

        /// Don't dereference the path if it is a symbolic link.
        const DONT_FOLLOW = ffi::FAN_MARK_DONT_FOLLOW;

        /// Only mark the path if it is a directory.
        const ONLYDIR = ffi::FAN_MARK_ONLYDIR;

        /// Mark the whole mount point the path belongs to.
        const MOUNT = ffi::FAN_MARK_MOUNT;

        /// The mask names events to ignore rather than events to report.
        const IGNORED_MASK = ffi::FAN_MARK_IGNORED_MASK;

        /// Keep the ignore mask even when the file is modified.
        const IGNORED_SURV_MODIFY = ffi::FAN_MARK_IGNORED_SURV_MODIFY;

        /// Remove all marks from the instance.
        const FLUSH = ffi::FAN_MARK_FLUSH;
    }
}

bitflags! {
    /// Mask describing an [`Event`], also passed when marking paths.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct EventMask: u64 {
        /// File was accessed.
        const ACCESS = ffi::FAN_ACCESS;

        /// File was modified.
        const MODIFY = ffi::FAN_MODIFY;

        /// File opened for writing was closed.
        const CLOSE_WRITE = ffi::FAN_CLOSE_WRITE;

        /// File not opened for writing was closed.
        const CLOSE_NOWRITE = ffi::FAN_CLOSE_NOWRITE;

        /// File was opened.
        const OPEN = ffi::FAN_OPEN;

        /// Event queue overflowed; events have presumably been lost.
        const Q_OVERFLOW = ffi::FAN_Q_OVERFLOW;

        /// Permission to open the file was requested.
        const OPEN_PERM = ffi::FAN_OPEN_PERM;

        /// Permission to access the file was requested.
        const ACCESS_PERM = ffi::FAN_ACCESS_PERM;

        /// Event occurred against a directory.
        const ONDIR = ffi::FAN_ONDIR;

        /// Also report events for children of marked directories.
        const EVENT_ON_CHILD = ffi::FAN_EVENT_ON_CHILD;

        /// Both close events.
        const CLOSE = ffi::FAN_CLOSE;
    }
}

/// Verdict for a permission event.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    /// Let the operation proceed.
    Allow,
    /// Refuse the operation; the triggering process gets `EPERM`.
    Deny,
}

impl Response {
    fn bits(self) -> u32 {
        match self {
            Response::Allow => ffi::FAN_ALLOW,
            Response::Deny => ffi::FAN_DENY,
        }
    }
}

/// A fanotify event.
///
/// Each event owns the file descriptor the kernel opened for the file the
/// event concerns. The descriptor is released by [`Event::close`], or when
/// the event is dropped. Queue-overflow events carry no descriptor.
#[derive(Debug)]
pub struct Event {
    /// Version tag of the record format this event was decoded from.
    pub version: u8,

    /// Shows what kind of event this is.
    pub mask: EventMask,

    /// Id of the process that triggered the event.
    pub pid: i32,

    fd: Option<RawFd>,
    filename: Option<Option<PathBuf>>,
}

impl Event {
    fn new(metadata: &ffi::fanotify_event_metadata) -> Event {
        let fd = match metadata.fd {
            ffi::FAN_NOFD => None,
            fd => Some(fd),
        };

        Event {
            version: metadata.vers,
            mask: EventMask::from_bits_retain(metadata.mask),
            pid: metadata.pid,
            fd,
            filename: None,
        }
    }

    /// The descriptor the kernel opened for the file this event concerns.
    ///
    /// Fails once [`Event::close`] has been called, and for events that
    /// never carried a descriptor (queue overflow).
    pub fn fd(&self) -> Result<RawFd> {
        self.fd
            .ok_or(Error::InvalidState("event carries no open descriptor"))
    }

    /// The path of the file this event concerns.
    ///
    /// Resolved on first access by following the process's own
    /// descriptor-to-path mapping under `/proc/self/fd`, and cached for
    /// subsequent calls. Returns `None` when resolution fails or the event
    /// carries no descriptor; the failure does not invalidate the event.
    pub fn filename(&mut self) -> Option<&Path> {
        let fd = self.fd;
        self.filename
            .get_or_insert_with(|| {
                fd.and_then(|fd| fs::read_link(format!("/proc/self/fd/{fd}")).ok())
            })
            .as_deref()
    }

    /// Releases the event's descriptor.
    ///
    /// The descriptor must not be used again afterwards; [`Event::fd`]
    /// fails from here on. Closing an event twice is an error.
    pub fn close(&mut self) -> Result<()> {
        match self.fd.take() {
            Some(fd) => match unsafe { libc::close(fd) } {
                0 => Ok(()),
                _ => Err(match util::errno() {
                    libc::EBADF => Error::InvalidState("event descriptor is not open"),
                    other => Error::Unknown(other),
                }),
            },
            None => Err(Error::InvalidState("event carries no open descriptor")),
        }
    }

    /// File was accessed.
    pub fn is_access(&self) -> bool {
        self.mask.contains(EventMask::ACCESS)
    }

    /// Permission to access the file was requested.
    pub fn is_access_perm(&self) -> bool {
        self.mask.contains(EventMask::ACCESS_PERM)
    }

    /// File was modified.
    pub fn is_modify(&self) -> bool {
        self.mask.contains(EventMask::MODIFY)
    }

    /// Either kind of close happened.
    pub fn is_close(&self) -> bool {
        self.mask.intersects(EventMask::CLOSE)
    }

    /// File opened for writing was closed.
    pub fn is_close_write(&self) -> bool {
        self.mask.contains(EventMask::CLOSE_WRITE)
    }

    /// File not opened for writing was closed.
    pub fn is_close_nowrite(&self) -> bool {
        self.mask.contains(EventMask::CLOSE_NOWRITE)
    }

    /// File was opened.
    pub fn is_open(&self) -> bool {
        self.mask.contains(EventMask::OPEN)
    }

    /// Permission to open the file was requested.
    pub fn is_open_perm(&self) -> bool {
        self.mask.contains(EventMask::OPEN_PERM)
    }

    /// The kernel event queue overflowed.
    pub fn is_queue_overflow(&self) -> bool {
        self.mask.contains(EventMask::Q_OVERFLOW)
    }

    /// The event occurred against a directory.
    pub fn is_dir(&self) -> bool {
        self.mask.contains(EventMask::ONDIR)
    }

    /// The event occurred against a child of a marked directory.
    pub fn is_on_child(&self) -> bool {
        self.mask.contains(EventMask::EVENT_ON_CHILD)
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Decoder for the fanotify record format: fixed-size records laid out
/// back to back, with no variable trailer.
#[derive(Clone, Copy, Debug, Default)]
pub struct FanotifyDecoder;

impl EventDecoder for FanotifyDecoder {
    type Event = Event;

    fn decode(&self, buffer: &[u8]) -> Result<Vec<Event>> {
        let record_size = mem::size_of::<ffi::fanotify_event_metadata>();

        if buffer.len() % record_size != 0 {
            return Err(Error::ProtocolViolation(
                "buffer length is not a multiple of the event record size",
            ));
        }

        let mut events = Vec::with_capacity(buffer.len() / record_size);
        for record in buffer.chunks_exact(record_size) {
            let metadata = unsafe {
                (record.as_ptr() as *const ffi::fanotify_event_metadata).read_unaligned()
            };

            // The kernel states each record's length in the record itself;
            // anything other than the fixed size would desynchronise the
            // fixed-stride walk.
            if metadata.event_len as usize != record_size {
                return Err(Error::ProtocolViolation(
                    "event record declares a length other than the record size",
                ));
            }

            events.push(Event::new(&metadata));
        }

        Ok(events)
    }
}

/// A fanotify instance.
///
/// Wraps the handle returned by `fanotify_init` in the shared event-source
/// abstraction, and adds mark management and permission responses on top.
#[derive(Debug)]
pub struct Fanotify {
    source: EventSource<FanotifyDecoder>,
}

impl Fanotify {
    /// Creates a fanotify instance.
    ///
    /// `CLOEXEC` is always passed to the kernel so the handle does not
    /// leak into processes spawned by the caller. `event_flags` sets the
    /// file status flags for the per-event descriptors.
    pub fn init(flags: InitFlags, event_flags: EventFlags) -> Result<Fanotify> {
        let fd =
            unsafe { ffi::fanotify_init(ffi::FAN_CLOEXEC | flags.bits(), event_flags.bits()) };

        if fd == -1 {
            return Err(match util::errno() {
                libc::EINVAL => Error::InvalidArgument("invalid fanotify initialization flag"),
                libc::EMFILE => {
                    Error::ResourceExhausted("maximum number of fanotify instances reached")
                }
                libc::ENOMEM => Error::InsufficientMemory,
                libc::EPERM => {
                    Error::PermissionDenied("fanotify initialization requires CAP_SYS_ADMIN")
                }
                other => Error::Unknown(other),
            });
        }

        let blocking = !flags.contains(InitFlags::NONBLOCK);
        Ok(Fanotify {
            source: EventSource::new(fd, FanotifyDecoder, blocking),
        })
    }

    /// Starts watching a path for the events in `mask`.
    ///
    /// `flags` qualifies the mark; [`MarkFlags::ADD`] is filled in. Pass
    /// [`MarkFlags::MOUNT`] to mark the whole mount point the path
    /// belongs to.
    pub fn watch<P>(&mut self, path: P, mask: EventMask, flags: MarkFlags) -> Result<()>
    where
        P: AsRef<Path>,
    {
        self.mark(path.as_ref(), mask, flags | MarkFlags::ADD)
    }

    /// Stops watching a path for the events in `mask`.
    pub fn ignore<P>(&mut self, path: P, mask: EventMask, flags: MarkFlags) -> Result<()>
    where
        P: AsRef<Path>,
    {
        self.mark(path.as_ref(), mask, flags | MarkFlags::REMOVE)
    }

    /// Removes all marks from the instance.
    pub fn flush(&mut self) -> Result<()> {
        let fd = self.source.fileno()?;
        let result = unsafe {
            ffi::fanotify_mark(fd, ffi::FAN_MARK_FLUSH, 0, libc::AT_FDCWD, ptr::null())
        };

        match result {
            0 => Ok(()),
            _ => Err(Self::mark_error(util::errno())),
        }
    }

    fn mark(&mut self, path: &Path, mask: EventMask, flags: MarkFlags) -> Result<()> {
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("mark path must not be empty"));
        }

        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument("mark path contains an interior NUL byte"))?;

        let fd = self.source.fileno()?;
        let result = unsafe {
            ffi::fanotify_mark(fd, flags.bits(), mask.bits(), libc::AT_FDCWD, path.as_ptr())
        };

        match result {
            0 => Ok(()),
            _ => Err(Self::mark_error(util::errno())),
        }
    }

    fn mark_error(errno: i32) -> Error {
        match errno {
            libc::EINVAL => Error::InvalidArgument("invalid mark flag or event mask"),
            libc::EBADF => Error::InvalidState("handle is not an open fanotify descriptor"),
            libc::ENOENT => {
                Error::StaleReference("marked path does not exist or carries no mark")
            }
            libc::ENOMEM => Error::InsufficientMemory,
            libc::ENOSPC => Error::ResourceExhausted("maximum number of marks reached"),
            other => Error::Unknown(other),
        }
    }

    /// Answers a permission event.
    ///
    /// Writes the verdict for the event's descriptor back to the kernel.
    /// The triggering process stays blocked until a response arrives or
    /// the event's descriptor is closed.
    pub fn respond(&mut self, event: &Event, response: Response) -> Result<()> {
        let fd = self.source.fileno()?;
        let response = ffi::fanotify_response {
            fd: event.fd()?,
            response: response.bits(),
        };

        let len = mem::size_of::<ffi::fanotify_response>();
        let written =
            unsafe { libc::write(fd, &response as *const _ as *const c_void, len) };

        match written {
            -1 => Err(match util::errno() {
                libc::ENOENT => {
                    Error::StaleReference("descriptor does not name a pending permission event")
                }
                libc::EBADF => Error::InvalidState("handle is not an open fanotify descriptor"),
                libc::EINVAL => Error::InvalidArgument("invalid permission response"),
                other => Error::Unknown(other),
            }),
            _ => Ok(()),
        }
    }

    /// Returns the underlying handle.
    pub fn fileno(&self) -> Result<RawFd> {
        self.source.fileno()
    }

    /// Returns exactly one event, reading from the kernel if none is
    /// queued. See [`EventSource::read_event`].
    pub fn read_event(&mut self) -> Result<Event> {
        self.source.read_event()
    }

    /// Returns all currently queued events, reading from the kernel if
    /// none are queued. See [`EventSource::read_events`].
    pub fn read_events(&mut self) -> Result<Vec<Event>> {
        self.source.read_events()
    }

    /// Blocks until an event is available, then returns it. See
    /// [`EventSource::wait`].
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<Event> {
        self.source.wait(timeout)
    }

    /// Discards all queued, not-yet-delivered events.
    ///
    /// The descriptors owned by the discarded events are released.
    pub fn truncate(&mut self) {
        self.source.truncate()
    }

    /// Closes the fanotify instance.
    ///
    /// Descriptors embedded in already delivered events stay open; they
    /// belong to the events, not to the instance.
    pub fn close(&mut self) -> Result<()> {
        self.source.close()
    }

    /// Returns a blocking iterator over the instance's events.
    pub fn events(&mut self) -> Events<'_, FanotifyDecoder> {
        self.source.events()
    }
}

#[cfg(test)]
mod tests {
    use std::mem;
    use std::os::unix::io::RawFd;
    use std::path::Path;
    use std::slice;

    use super::{EventMask, FanotifyDecoder};
    use crate::errors::Error;
    use crate::ffi;
    use crate::source::EventDecoder;

    const RECORD_SIZE: usize = mem::size_of::<ffi::fanotify_event_metadata>();

    fn record(mask: u64, fd: i32, pid: i32) -> Vec<u8> {
        record_with_len(RECORD_SIZE as u32, mask, fd, pid)
    }

    fn record_with_len(event_len: u32, mask: u64, fd: i32, pid: i32) -> Vec<u8> {
        let metadata = ffi::fanotify_event_metadata {
            event_len,
            vers: ffi::FANOTIFY_METADATA_VERSION,
            reserved: 0,
            metadata_len: RECORD_SIZE as u16,
            mask,
            fd,
            pid,
        };

        unsafe { slice::from_raw_parts(&metadata as *const _ as *const u8, RECORD_SIZE) }
            .to_vec()
    }

    fn open_devnull() -> RawFd {
        let fd = unsafe {
            libc::open(b"/dev/null\0".as_ptr() as *const libc::c_char, libc::O_RDONLY)
        };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn decodes_an_empty_buffer_to_no_events() {
        assert!(FanotifyDecoder.decode(&[]).unwrap().is_empty());
    }

    #[test]
    fn decodes_records_in_buffer_order() {
        let mut buffer = record(ffi::FAN_MODIFY, ffi::FAN_NOFD, 100);
        buffer.extend(record(ffi::FAN_CLOSE_WRITE, ffi::FAN_NOFD, 200));

        let events = FanotifyDecoder.decode(&buffer).unwrap();
        assert_eq!(2, events.len());

        assert_eq!(ffi::FANOTIFY_METADATA_VERSION, events[0].version);
        assert_eq!(100, events[0].pid);
        assert!(events[0].is_modify());
        assert!(!events[0].is_close());

        assert_eq!(200, events[1].pid);
        assert!(events[1].is_close_write());
        assert!(events[1].is_close());
    }

    #[test]
    fn non_multiple_buffer_length_is_a_protocol_violation() {
        let mut buffer = record(ffi::FAN_OPEN, ffi::FAN_NOFD, 1);
        buffer.truncate(RECORD_SIZE - 3);

        let result = FanotifyDecoder.decode(&buffer);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn mismatched_record_length_is_a_protocol_violation() {
        let buffer = record_with_len(RECORD_SIZE as u32 + 8, ffi::FAN_OPEN, ffi::FAN_NOFD, 1);

        let result = FanotifyDecoder.decode(&buffer);
        assert!(matches!(result, Err(Error::ProtocolViolation(_))));
    }

    #[test]
    fn permission_event_exposes_its_descriptor() {
        let fd = open_devnull();
        let buffer = record(ffi::FAN_OPEN_PERM, fd, 1);

        let mut events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &mut events[0];

        assert!(event.is_open_perm());
        assert!(!event.is_open());
        assert_eq!(Ok(fd), event.fd());
    }

    #[test]
    fn close_invalidates_the_descriptor() {
        let fd = open_devnull();
        let buffer = record(ffi::FAN_OPEN, fd, 1);

        let mut events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &mut events[0];

        assert_eq!(Ok(()), event.close());
        assert!(matches!(event.fd(), Err(Error::InvalidState(_))));
        assert!(matches!(event.close(), Err(Error::InvalidState(_))));
    }

    #[test]
    fn overflow_record_carries_no_descriptor() {
        let buffer = record(ffi::FAN_Q_OVERFLOW, ffi::FAN_NOFD, 0);

        let mut events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &mut events[0];

        assert!(event.is_queue_overflow());
        assert!(matches!(event.fd(), Err(Error::InvalidState(_))));
        assert_eq!(None, event.filename());
    }

    #[test]
    fn filename_resolves_through_the_descriptor_and_is_cached() {
        let fd = open_devnull();
        let buffer = record(ffi::FAN_OPEN, fd, 1);

        let mut events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &mut events[0];

        assert_eq!(Some(Path::new("/dev/null")), event.filename());

        // Still resolved after the descriptor is gone; the value was
        // computed once and cached.
        event.close().unwrap();
        assert_eq!(Some(Path::new("/dev/null")), event.filename());
    }

    #[test]
    fn filename_is_the_sentinel_after_close_without_prior_resolution() {
        let fd = open_devnull();
        let buffer = record(ffi::FAN_OPEN, fd, 1);

        let mut events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &mut events[0];

        event.close().unwrap();
        assert_eq!(None, event.filename());
    }

    #[test]
    fn predicates_track_the_raw_mask_bits() {
        let buffer = record(ffi::FAN_MODIFY, ffi::FAN_NOFD, 1);

        let events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &events[0];

        assert!(event.is_modify());
        assert!(!event.is_access());
        assert!(!event.is_access_perm());
        assert!(!event.is_close());
        assert!(!event.is_close_write());
        assert!(!event.is_close_nowrite());
        assert!(!event.is_open());
        assert!(!event.is_open_perm());
        assert!(!event.is_queue_overflow());
        assert!(!event.is_dir());
        assert!(!event.is_on_child());
    }

    #[test]
    fn event_mask_combines_directory_and_action_flags() {
        let buffer = record(ffi::FAN_OPEN | ffi::FAN_ONDIR, ffi::FAN_NOFD, 1);

        let events = FanotifyDecoder.decode(&buffer).unwrap();
        assert!(events[0].is_open());
        assert!(events[0].is_dir());
    }

    #[test]
    fn mask_round_trips_into_the_event() {
        let buffer = record(
            ffi::FAN_ACCESS_PERM | ffi::FAN_EVENT_ON_CHILD,
            ffi::FAN_NOFD,
            42,
        );

        let events = FanotifyDecoder.decode(&buffer).unwrap();
        let event = &events[0];

        assert_eq!(
            EventMask::ACCESS_PERM | EventMask::EVENT_ON_CHILD,
            event.mask
        );
        assert!(event.is_access_perm());
        assert!(event.is_on_child());
        assert_eq!(42, event.pid);
    }
}
