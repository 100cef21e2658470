//! The event-source abstraction shared by both notification subsystems.
//!
//! An [`EventSource`] owns one readable kernel handle and a FIFO queue of
//! decoded events awaiting delivery. Reading works in cycles: probe how many
//! bytes the kernel has queued, read exactly that many, hand the buffer to
//! the decoder, and queue whatever comes back. The queue only ever holds
//! fully decoded events; no partial record is ever queued.

use std::collections::VecDeque;
use std::fmt;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::errors::{Error, Result};
use crate::util;

/// Decodes a raw kernel buffer into a batch of events.
///
/// One implementation exists per notification subsystem. Decoding is
/// all-or-nothing: a buffer that does not tile exactly into whole records
/// must fail with [`Error::ProtocolViolation`] and yield no events.
pub trait EventDecoder {
    /// The event record type this decoder produces.
    type Event;

    /// Decodes every record in `buffer`, in buffer order.
    fn decode(&self, buffer: &[u8]) -> Result<Vec<Self::Event>>;
}

/// A queue of events read from one kernel handle.
///
/// The handle is owned exclusively: it is closed when [`close`] is called or
/// when the source is dropped, and every operation after that fails with
/// [`Error::InvalidState`].
///
/// [`close`]: EventSource::close
pub struct EventSource<D: EventDecoder> {
    fd: Option<RawFd>,
    decoder: D,
    queue: VecDeque<D::Event>,
    blocking: bool,
}

impl<D: EventDecoder> EventSource<D> {
    /// Wraps an already-open kernel handle.
    ///
    /// Takes ownership of `fd`. `blocking` records whether the handle was
    /// created in blocking mode; with a non-blocking handle, read operations
    /// report [`Error::WouldBlock`] instead of waiting.
    pub fn new(fd: RawFd, decoder: D, blocking: bool) -> Self {
        EventSource {
            fd: Some(fd),
            decoder,
            queue: VecDeque::new(),
            blocking,
        }
    }

    /// Returns the underlying handle.
    pub fn fileno(&self) -> Result<RawFd> {
        self.fd
            .ok_or(Error::InvalidState("I/O operation on closed source"))
    }

    /// Whether the underlying handle was created in blocking mode.
    pub fn is_blocking(&self) -> bool {
        self.blocking
    }

    /// Whether the source has been closed.
    pub fn is_closed(&self) -> bool {
        self.fd.is_none()
    }

    /// Returns exactly one event.
    ///
    /// Pops the head of the queue if one is available; otherwise performs a
    /// read-and-decode cycle, returns the first decoded event and queues the
    /// rest. Fails with [`Error::WouldBlock`] if the cycle produced nothing.
    pub fn read_event(&mut self) -> Result<D::Event> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }

        let mut events = self.refill()?.into_iter();
        let first = events.next().ok_or(Error::WouldBlock)?;
        self.queue.extend(events);

        Ok(first)
    }

    /// Returns all currently queued events.
    ///
    /// If the queue is empty, performs exactly one read-and-decode cycle and
    /// returns everything it produced, which may be nothing.
    pub fn read_events(&mut self) -> Result<Vec<D::Event>> {
        if !self.queue.is_empty() {
            return Ok(self.queue.drain(..).collect());
        }

        self.refill()
    }

    /// Blocks until an event is available, then returns it.
    ///
    /// A queued event is returned immediately without touching the handle.
    /// Otherwise the calling thread is suspended until the handle becomes
    /// readable; if `timeout` expires first, fails with [`Error::Timeout`].
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<D::Event> {
        if let Some(event) = self.queue.pop_front() {
            return Ok(event);
        }

        let fd = self.fileno()?;
        if !util::await_readable(fd, timeout)? {
            return Err(Error::Timeout);
        }

        self.read_event()
    }

    /// Discards all queued, not-yet-delivered events.
    ///
    /// Events still pending inside the kernel are unaffected; the next read
    /// cycle will pick them up as usual.
    pub fn truncate(&mut self) {
        self.queue.clear();
    }

    /// Closes the underlying handle.
    ///
    /// Calling `close` again on an already closed source is a no-op; every
    /// other operation on a closed source fails.
    pub fn close(&mut self) -> Result<()> {
        match self.fd.take() {
            Some(fd) => match unsafe { libc::close(fd) } {
                0 => Ok(()),
                _ => Err(match util::errno() {
                    libc::EBADF => Error::InvalidState("handle is not open"),
                    other => Error::Unknown(other),
                }),
            },
            None => Ok(()),
        }
    }

    /// Returns an iterator that blocks on [`wait`] for each event.
    ///
    /// The iterator is infinite; it ends only when the caller stops
    /// consuming it, and yields errors once the source is closed.
    ///
    /// [`wait`]: EventSource::wait
    pub fn events(&mut self) -> Events<'_, D> {
        Events { source: self }
    }

    /// One probe-read-decode cycle against the kernel.
    ///
    /// The pending-byte count is sampled before the read; another user of
    /// the same descriptor can change what the read observes in between.
    /// The queue is left untouched if the read or the decode fails.
    fn refill(&mut self) -> Result<Vec<D::Event>> {
        let fd = self.fileno()?;

        let pending = util::buffered_bytes(fd)?;
        let mut buffer = vec![0u8; pending];

        // A zero-length read can never yield bytes (the buffer has no room),
        // so it only ever decodes to nothing. Issuing it anyway is harmless
        // on a pipe but blocks forever on a blocking inotify handle, whose
        // read waits for an event even when asked for zero bytes. Skip it and
        // decode the empty buffer directly, which is the same result without
        // the hang.
        if pending == 0 {
            return self.decoder.decode(&buffer);
        }

        let len = util::read_into_buffer(fd, &mut buffer);
        if len < 0 {
            return Err(match util::errno() {
                libc::EAGAIN => Error::WouldBlock,
                libc::EBADF => Error::InvalidState("handle is not open"),
                other => Error::Unknown(other),
            });
        }

        self.decoder.decode(&buffer[..len as usize])
    }
}

impl<D: EventDecoder> fmt::Debug for EventSource<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSource")
            .field("fd", &self.fd)
            .field("queued", &self.queue.len())
            .field("blocking", &self.blocking)
            .finish()
    }
}

impl<D: EventDecoder> Drop for EventSource<D> {
    fn drop(&mut self) {
        if let Some(fd) = self.fd.take() {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

/// Blocking iterator over the events of a source.
///
/// Returned by [`EventSource::events`]. Each step consumes source state, so
/// the iteration is not restartable.
pub struct Events<'a, D: EventDecoder> {
    source: &'a mut EventSource<D>,
}

impl<'a, D: EventDecoder> Iterator for Events<'a, D> {
    type Item = Result<D::Event>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.source.wait(None))
    }
}
