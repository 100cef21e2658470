//! Wrapper for inotify, the per-watch filesystem notification API.
//!
//! An [`Inotify`] instance watches paths registered with
//! [`Inotify::add_watch`] and delivers an [`Event`] for each change the
//! kernel observes. Events are read through the shared
//! [`EventSource`](crate::source::EventSource) capability set: one at a
//! time, in batches, or by blocking until one arrives.
//!
//! See the [inotify(7)] man page for the semantics of the underlying API,
//! which this module follows closely.
//!
//! [inotify(7)]: https://man7.org/linux/man-pages/man7/inotify.7.html

use std::ffi::{CString, OsStr, OsString};
use std::mem;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;

use bitflags::bitflags;
use libc::c_int;

use crate::errors::{Error, Result};
use crate::ffi;
use crate::source::{EventDecoder, EventSource, Events};
use crate::util;

bitflags! {
    /// Flags for [`Inotify::init`].
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct InitFlags: u32 {
        /// Close the handle automatically on exec().
        const CLOEXEC = ffi::IN_CLOEXEC as u32;

        /// Put the handle in non-blocking mode.
        const NONBLOCK = ffi::IN_NONBLOCK as u32;
    }
}

bitflags! {
    /// Mask for a file watch.
    ///
    /// Passed to [`Inotify::add_watch`], to describe what file system
    /// events to watch for and how to do that.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct WatchMask: u32 {
        /// File was accessed.
        const ACCESS = ffi::IN_ACCESS;

        /// Metadata changed.
        const ATTRIB = ffi::IN_ATTRIB;

        /// File opened for writing was closed.
        const CLOSE_WRITE = ffi::IN_CLOSE_WRITE;

        /// File or directory not opened for writing was closed.
        const CLOSE_NOWRITE = ffi::IN_CLOSE_NOWRITE;

        /// File/directory created in watched directory.
        const CREATE = ffi::IN_CREATE;

        /// File/directory deleted from watched directory.
        const DELETE = ffi::IN_DELETE;

        /// Watched file/directory was itself deleted.
        const DELETE_SELF = ffi::IN_DELETE_SELF;

        /// File was modified.
        const MODIFY = ffi::IN_MODIFY;

        /// Watched file/directory was itself moved.
        const MOVE_SELF = ffi::IN_MOVE_SELF;

        /// Generated for the directory containing the old filename when a
        /// file is renamed.
        const MOVED_FROM = ffi::IN_MOVED_FROM;

        /// Generated for the directory containing the new filename when a
        /// file is renamed.
        const MOVED_TO = ffi::IN_MOVED_TO;

        /// File or directory was opened.
        const OPEN = ffi::IN_OPEN;

        /// Watch for all events.
        const ALL_EVENTS = ffi::IN_ALL_EVENTS;

        /// Watch for both `MOVED_FROM` and `MOVED_TO`.
        const MOVE = ffi::IN_MOVE;

        /// Watch for both `CLOSE_WRITE` and `CLOSE_NOWRITE`.
        const CLOSE = ffi::IN_CLOSE;

        /// Don't dereference the path if it is a symbolic link.
        const DONT_FOLLOW = ffi::IN_DONT_FOLLOW;

        /// Don't watch events for children that have been unlinked from
        /// the watched directory.
        const EXCL_UNLINK = ffi::IN_EXCL_UNLINK;

        /// If a watch already exists for the inode, amend its mask instead
        /// of replacing it.
        const MASK_ADD = ffi::IN_MASK_ADD;

        /// Only monitor for one event, then remove the watch.
        const ONESHOT = ffi::IN_ONESHOT;

        /// Only watch the path if it is a directory.
        const ONLYDIR = ffi::IN_ONLYDIR;
    }
}

bitflags! {
    /// Mask describing an [`Event`].
    ///
    /// Contains the event bits of [`WatchMask`] plus the bits the kernel
    /// sets on delivered events only.
    #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy)]
    pub struct EventMask: u32 {
        /// File was accessed.
        const ACCESS = ffi::IN_ACCESS;

        /// Metadata changed.
        const ATTRIB = ffi::IN_ATTRIB;

        /// File opened for writing was closed.
        const CLOSE_WRITE = ffi::IN_CLOSE_WRITE;

        /// File or directory not opened for writing was closed.
        const CLOSE_NOWRITE = ffi::IN_CLOSE_NOWRITE;

        /// File/directory created in watched directory.
        const CREATE = ffi::IN_CREATE;

        /// File/directory deleted from watched directory.
        const DELETE = ffi::IN_DELETE;

        /// Watched file/directory was itself deleted.
        const DELETE_SELF = ffi::IN_DELETE_SELF;

        /// File was modified.
        const MODIFY = ffi::IN_MODIFY;

        /// Watched file/directory was itself moved.
        const MOVE_SELF = ffi::IN_MOVE_SELF;

        /// File was moved out of the watched directory.
        const MOVED_FROM = ffi::IN_MOVED_FROM;

        /// File was moved into the watched directory.
        const MOVED_TO = ffi::IN_MOVED_TO;

        /// File or directory was opened.
        const OPEN = ffi::IN_OPEN;

        /// Watch was removed, explicitly or because the file was deleted
        /// or its file system was unmounted.
        const IGNORED = ffi::IN_IGNORED;

        /// Subject of this event is a directory.
        const ISDIR = ffi::IN_ISDIR;

        /// Event queue overflowed; events have presumably been lost.
        const Q_OVERFLOW = ffi::IN_Q_OVERFLOW;

        /// File system containing the watched object was unmounted.
        const UNMOUNT = ffi::IN_UNMOUNT;

        /// Both move events.
        const MOVE = ffi::IN_MOVE;

        /// Both close events.
        const CLOSE = ffi::IN_CLOSE;
    }
}

/// Represents a file that inotify is watching.
///
/// Can be obtained from [`Inotify::add_watch`] or from an [`Event`]. A
/// watch descriptor can be used to get inotify to stop watching a file by
/// passing it to [`Inotify::rm_watch`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct WatchDescriptor(pub(crate) c_int);

impl WatchDescriptor {
    /// The raw identifier the kernel uses for this watch.
    ///
    /// The mapping from identifier to path is maintained by the kernel (and
    /// possibly the caller), not by this crate.
    pub fn id(&self) -> c_int {
        self.0
    }
}

/// An inotify event.
///
/// A file system change that the caller previously registered interest in
/// via [`Inotify::add_watch`].
#[derive(Clone, Debug)]
pub struct Event {
    /// Identifies the watch this event originates from.
    ///
    /// Equal to the [`WatchDescriptor`] that [`Inotify::add_watch`]
    /// returned when interest for this event was registered.
    pub wd: WatchDescriptor,

    /// Shows what kind of event this is.
    pub mask: EventMask,

    /// Connects related events to each other.
    ///
    /// When a file is renamed, this results in two events: `MOVED_FROM`
    /// and `MOVED_TO`. The `cookie` field is the same for both of them,
    /// making it possible to connect the pair.
    pub cookie: u32,

    /// The name of the file the event originates from.
    ///
    /// Set only if the subject of the event is an entry inside a watched
    /// directory; `None` for events on the watched object itself.
    pub name: Option<OsString>,
}

impl Event {
    /// File was accessed.
    pub fn is_access(&self) -> bool {
        self.mask.contains(EventMask::ACCESS)
    }

    /// File was modified.
    pub fn is_modify(&self) -> bool {
        self.mask.contains(EventMask::MODIFY)
    }

    /// Metadata changed.
    pub fn is_attrib(&self) -> bool {
        self.mask.contains(EventMask::ATTRIB)
    }

    /// File opened for writing was closed.
    pub fn is_close_write(&self) -> bool {
        self.mask.contains(EventMask::CLOSE_WRITE)
    }

    /// File or directory not opened for writing was closed.
    pub fn is_close_nowrite(&self) -> bool {
        self.mask.contains(EventMask::CLOSE_NOWRITE)
    }

    /// Either kind of close happened.
    pub fn is_close(&self) -> bool {
        self.mask.intersects(EventMask::CLOSE)
    }

    /// File or directory was opened.
    pub fn is_open(&self) -> bool {
        self.mask.contains(EventMask::OPEN)
    }

    /// File was moved out of the watched directory.
    pub fn is_moved_from(&self) -> bool {
        self.mask.contains(EventMask::MOVED_FROM)
    }

    /// File was moved into the watched directory.
    pub fn is_moved_to(&self) -> bool {
        self.mask.contains(EventMask::MOVED_TO)
    }

    /// Either kind of move happened.
    pub fn is_move(&self) -> bool {
        self.mask.intersects(EventMask::MOVE)
    }

    /// File/directory was created in the watched directory.
    pub fn is_create(&self) -> bool {
        self.mask.contains(EventMask::CREATE)
    }

    /// File/directory was deleted from the watched directory.
    pub fn is_delete(&self) -> bool {
        self.mask.contains(EventMask::DELETE)
    }

    /// The watched file/directory was itself deleted.
    pub fn is_delete_self(&self) -> bool {
        self.mask.contains(EventMask::DELETE_SELF)
    }

    /// The watched file/directory was itself moved.
    pub fn is_move_self(&self) -> bool {
        self.mask.contains(EventMask::MOVE_SELF)
    }

    /// The subject of the event is a directory.
    pub fn is_dir(&self) -> bool {
        self.mask.contains(EventMask::ISDIR)
    }

    /// The file system containing the watched object was unmounted.
    pub fn is_unmount(&self) -> bool {
        self.mask.contains(EventMask::UNMOUNT)
    }

    /// The kernel event queue overflowed.
    pub fn is_queue_overflow(&self) -> bool {
        self.mask.contains(EventMask::Q_OVERFLOW)
    }

    /// The watch was removed.
    pub fn is_ignored(&self) -> bool {
        self.mask.contains(EventMask::IGNORED)
    }
}

/// Decoder for the inotify record format: a fixed header followed by a
/// NUL-padded name whose length the header declares.
#[derive(Clone, Copy, Debug, Default)]
pub struct InotifyDecoder;

impl EventDecoder for InotifyDecoder {
    type Event = Event;

    fn decode(&self, buffer: &[u8]) -> Result<Vec<Event>> {
        let header_size = mem::size_of::<ffi::inotify_event>();

        let mut events = Vec::new();
        let mut pos = 0;
        while pos < buffer.len() {
            let record = &buffer[pos..];
            if record.len() < header_size {
                return Err(Error::ProtocolViolation(
                    "event header extends past the end of the buffer",
                ));
            }

            // The byte buffer has alignment 1 while `inotify_event` has a
            // higher alignment, so the header must be read unaligned.
            let header =
                unsafe { (record.as_ptr() as *const ffi::inotify_event).read_unaligned() };

            let record_len = header_size + header.len as usize;
            if record.len() < record_len {
                return Err(Error::ProtocolViolation(
                    "event name extends past the end of the buffer",
                ));
            }

            // A name length of zero means no name field at all, not an
            // empty name. When present, the name is filled up with NUL
            // bytes to the declared length; everything from the first NUL
            // on is padding. The `unwrap` is safe because `splitn` always
            // returns at least one result.
            let name = match header.len {
                0 => None,
                _ => {
                    let padded = &record[header_size..record_len];
                    let name = padded.splitn(2, |byte| *byte == 0).next().unwrap();
                    Some(OsStr::from_bytes(name).to_os_string())
                }
            };

            events.push(Event {
                wd: WatchDescriptor(header.wd),
                mask: EventMask::from_bits_retain(header.mask),
                cookie: header.cookie,
                name,
            });

            pos += record_len;
        }

        Ok(events)
    }
}

/// An inotify instance.
///
/// Wraps the handle returned by `inotify_init1` in the shared event-source
/// abstraction, and adds watch registration on top.
#[derive(Debug)]
pub struct Inotify {
    source: EventSource<InotifyDecoder>,
}

impl Inotify {
    /// Creates an inotify instance.
    ///
    /// `CLOEXEC` is always passed to the kernel so the handle does not leak
    /// into processes spawned by the caller. Pass
    /// [`InitFlags::NONBLOCK`] to make read operations fail with
    /// [`Error::WouldBlock`] instead of waiting.
    pub fn init(flags: InitFlags) -> Result<Inotify> {
        let fd = unsafe { ffi::inotify_init1(ffi::IN_CLOEXEC | flags.bits() as c_int) };

        if fd == -1 {
            return Err(match util::errno() {
                libc::EINVAL => Error::InvalidArgument("invalid inotify initialization flag"),
                libc::EMFILE => {
                    Error::ResourceExhausted("maximum number of inotify instances reached")
                }
                libc::ENFILE => Error::ResourceExhausted("file descriptor limit hit"),
                libc::ENOMEM => Error::InsufficientMemory,
                other => Error::Unknown(other),
            });
        }

        let blocking = !flags.contains(InitFlags::NONBLOCK);
        Ok(Inotify {
            source: EventSource::new(fd, InotifyDecoder, blocking),
        })
    }

    /// Starts watching a path for the events in `mask`.
    ///
    /// Returns a [`WatchDescriptor`] that identifies this watch in
    /// delivered events and can be passed to [`Inotify::rm_watch`]. Adding
    /// a watch for a path whose inode is already watched updates the
    /// existing watch and returns the same descriptor.
    pub fn add_watch<P>(&mut self, path: P, mask: WatchMask) -> Result<WatchDescriptor>
    where
        P: AsRef<Path>,
    {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument("watch path must not be empty"));
        }

        let path = CString::new(path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument("watch path contains an interior NUL byte"))?;

        let fd = self.source.fileno()?;
        let wd = unsafe { ffi::inotify_add_watch(fd, path.as_ptr(), mask.bits()) };

        match wd {
            -1 => Err(match util::errno() {
                libc::EINVAL => Error::InvalidArgument("event mask contains no valid events"),
                libc::EACCES => {
                    Error::PermissionDenied("read access to the watched path was denied")
                }
                libc::EBADF => Error::InvalidState("handle is not an open inotify descriptor"),
                libc::EFAULT => {
                    Error::InvalidArgument("watch path lies outside the accessible address space")
                }
                libc::ENOENT => {
                    Error::InvalidArgument("a component of the watch path does not exist")
                }
                libc::ENOSPC => Error::ResourceExhausted("maximum number of watches reached"),
                libc::ENOMEM => Error::InsufficientMemory,
                other => Error::Unknown(other),
            }),
            _ => Ok(WatchDescriptor(wd)),
        }
    }

    /// Stops watching the file represented by `wd`.
    pub fn rm_watch(&mut self, wd: WatchDescriptor) -> Result<()> {
        let fd = self.source.fileno()?;
        let result = unsafe { ffi::inotify_rm_watch(fd, wd.0) };

        match result {
            0 => Ok(()),
            _ => Err(match util::errno() {
                libc::EINVAL => {
                    Error::StaleReference("watch descriptor does not name a live watch")
                }
                libc::EBADF => Error::InvalidState("handle is not an open inotify descriptor"),
                other => Error::Unknown(other),
            }),
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
    pub fn truncate(&mut self) {
        self.source.truncate()
    }

    /// Closes the inotify instance. Also removes every watch attached to
    /// it.
    pub fn close(&mut self) -> Result<()> {
        self.source.close()
    }

    /// Returns a blocking iterator over the instance's events.
    pub fn events(&mut self) -> Events<'_, InotifyDecoder> {
        self.source.events()
    }
}
