// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

//! Destinations for process output
//!
//! A [`Sink`] is a bundle of optional capabilities (write, put, flush,
//! rewind) that is resolved once when the sink is built. Sinks are cheap
//! handles: cloning one yields the same sink, and two sinks built over the
//! same shared object compare equal. That identity is how a destination
//! requested for both stdout and stderr is recognised.

use crate::error::{Error, Result};
use crate::segment::Stream;

use std::fmt::{Debug, Display};
use std::io::{self, ErrorKind, Seek, SeekFrom, Write};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};

type WriteFn = dyn Fn(&[u8]) -> io::Result<()> + Send + Sync;
type PutFn = dyn Fn(Vec<u8>) -> io::Result<()> + Send + Sync;
type ActionFn = dyn Fn() -> io::Result<()> + Send + Sync;

static STDOUT: u8 = 0;
static STDERR: u8 = 0;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> io::Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| io::Error::new(ErrorKind::Other, "sink mutex poisoned"))
}

fn address<T: ?Sized>(target: &Arc<T>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// Whether an error means the destination has already gone away
pub fn is_closed(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        ErrorKind::BrokenPipe | ErrorKind::NotConnected
    )
}

/// Whether an error means the sink cannot seek at all
pub fn is_unsupported(error: &io::Error) -> bool {
    error.kind() == ErrorKind::Unsupported || error.raw_os_error() == Some(libc::ESPIPE)
}

/// How sinks are turned into callbacks
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Options {
    /// Flush flushable sinks after every write
    pub flush: bool,

    /// Silently drop writes to sinks that have been closed
    pub closable: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            flush: true,
            closable: true,
        }
    }
}

struct Inner {
    target: Option<usize>,
    name: String,
    write: Option<Box<WriteFn>>,
    put: Option<Box<PutFn>>,
    flush: Option<Box<ActionFn>>,
    rewind: Option<Box<ActionFn>>,
    closable: bool,
}

/// A destination for segments
#[derive(Clone)]
pub struct Sink(Arc<Inner>);

impl PartialEq for Sink {
    fn eq(&self, other: &Self) -> bool {
        match (self.0.target, other.0.target) {
            (Some(lhs), Some(rhs)) => lhs == rhs,
            _ => Arc::ptr_eq(&self.0, &other.0),
        }
    }
}

impl Eq for Sink {}

impl Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink")
            .field("name", &self.0.name)
            .field("write", &self.0.write.is_some())
            .field("put", &self.0.put.is_some())
            .field("flush", &self.0.flush.is_some())
            .field("rewind", &self.0.rewind.is_some())
            .field("closable", &self.0.closable)
            .finish()
    }
}

impl Display for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0.name)
    }
}

impl Sink {
    /// Starts a sink with a custom set of capabilities
    pub fn builder(name: impl Into<String>) -> Builder {
        Builder {
            target: None,
            name: name.into(),
            write: None,
            put: None,
            flush: None,
            rewind: None,
            closable: false,
        }
    }

    /// A shared writer; flushable and closable
    pub fn writer<W: Write + Send + 'static>(writer: Arc<Mutex<W>>) -> Self {
        Self::builder(std::any::type_name::<W>())
            .writer(writer)
            .build()
    }

    /// A shared seekable writer; rewound at the end of a run
    pub fn seekable<W: Write + Seek + Send + 'static>(writer: Arc<Mutex<W>>) -> Self {
        Self::builder(std::any::type_name::<W>())
            .seekable(writer)
            .build()
    }

    /// A queue receiving raw segments
    ///
    /// The queue's identity is this handle: clone the returned sink to share
    /// it between stdout and stderr. A dropped receiver counts as closed.
    pub fn queue(sender: Sender<Vec<u8>>) -> Self {
        Self::builder("queue").queue(sender).build()
    }

    /// The parent's own standard output
    pub fn stdout() -> Self {
        let mut builder = Self::builder("stdout").writer(Arc::new(Mutex::new(io::stdout())));
        builder.target = Some(&STDOUT as *const u8 as usize);
        builder.build()
    }

    /// The parent's own standard error
    pub fn stderr() -> Self {
        let mut builder = Self::builder("stderr").writer(Arc::new(Mutex::new(io::stderr())));
        builder.target = Some(&STDERR as *const u8 as usize);
        builder.build()
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Flushes the sink; `None` if it cannot be flushed
    pub fn flush(&self) -> Option<io::Result<()>> {
        self.0.flush.as_ref().map(|flush| flush())
    }

    /// Seeks the sink back to its start; `None` if it cannot be rewound
    pub fn rewind(&self) -> Option<io::Result<()>> {
        self.0.rewind.as_ref().map(|rewind| rewind())
    }

    /// Converts the sink into a callback for one stream role
    ///
    /// Fails if the sink has neither a write nor a put capability.
    pub fn callback(&self, options: Options) -> Result<Callback> {
        if self.0.write.is_none() && self.0.put.is_none() {
            return Err(Error::UnknownSink(self.0.name.clone()));
        }

        Ok(Callback {
            sink: self.clone(),
            flush: options.flush && self.0.flush.is_some(),
            closable: options.closable && self.0.closable,
            state: State::Open,
        })
    }
}

/// Assembles a [`Sink`] from individual capabilities
pub struct Builder {
    target: Option<usize>,
    name: String,
    write: Option<Box<WriteFn>>,
    put: Option<Box<PutFn>>,
    flush: Option<Box<ActionFn>>,
    rewind: Option<Box<ActionFn>>,
    closable: bool,
}

impl Builder {
    pub fn write(mut self, write: impl Fn(&[u8]) -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.write = Some(Box::new(write));
        self
    }

    pub fn put(mut self, put: impl Fn(Vec<u8>) -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.put = Some(Box::new(put));
        self
    }

    pub fn flush(mut self, flush: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.flush = Some(Box::new(flush));
        self
    }

    pub fn rewind(mut self, rewind: impl Fn() -> io::Result<()> + Send + Sync + 'static) -> Self {
        self.rewind = Some(Box::new(rewind));
        self
    }

    /// Whether write failures on a closed resource may be dropped
    pub fn closable(mut self, closable: bool) -> Self {
        self.closable = closable;
        self
    }

    /// Identifies the sink by a shared object instead of by handle
    pub fn identity<T: ?Sized>(mut self, target: &Arc<T>) -> Self {
        self.target = Some(address(target));
        self
    }

    /// Writes and flushes through a shared writer
    pub fn writer<W: Write + Send + 'static>(self, writer: Arc<Mutex<W>>) -> Self {
        let w = writer.clone();
        let f = writer.clone();
        self.identity(&writer)
            .write(move |bytes| lock(&w)?.write_all(bytes))
            .flush(move || lock(&f)?.flush())
            .closable(true)
    }

    /// Like [`Builder::writer`], and rewinds to the start at the end of a run
    pub fn seekable<W: Write + Seek + Send + 'static>(self, writer: Arc<Mutex<W>>) -> Self {
        let s = writer.clone();
        self.writer(writer)
            .rewind(move || lock(&s)?.seek(SeekFrom::Start(0)).map(|_| ()))
    }

    /// Puts raw segments onto a channel
    pub fn queue(self, sender: Sender<Vec<u8>>) -> Self {
        self.put(move |bytes| {
            sender
                .send(bytes)
                .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "queue receiver dropped"))
        })
        .closable(true)
    }

    pub fn build(self) -> Sink {
        Sink(Arc::new(Inner {
            target: self.target,
            name: self.name,
            write: self.write,
            put: self.put,
            flush: self.flush,
            rewind: self.rewind,
            closable: self.closable,
        }))
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum State {
    Open,
    Closed,
    Failed,
}

/// A sink bound to one stream role
///
/// Applies flush-after-write and closed-resource tolerance. Once a sink has
/// been found closed, or has failed, the callback stops touching it.
#[derive(Debug)]
pub struct Callback {
    sink: Sink,
    flush: bool,
    closable: bool,
    state: State,
}

impl Callback {
    pub fn sink(&self) -> &Sink {
        &self.sink
    }

    /// Whether the callback will still deliver segments
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    fn deliver(&self, bytes: &[u8]) -> io::Result<()> {
        let inner = &self.sink.0;

        if let Some(put) = &inner.put {
            return put(bytes.to_vec());
        }

        if let Some(write) = &inner.write {
            write(bytes)?;
            if self.flush {
                if let Some(flush) = &inner.flush {
                    flush()?;
                }
            }
        }

        Ok(())
    }

    /// Delivers one segment
    ///
    /// The closed condition is swallowed when the sink is closable. Any other
    /// failure is returned once; the callback is inert afterwards.
    pub fn call(&mut self, bytes: &[u8], stream: Stream) -> Result<()> {
        if self.state != State::Open {
            trace!("skipping {} segment for {} sink {}", stream, self.state_name(), self.sink);
            return Ok(());
        }

        match self.deliver(bytes) {
            Ok(()) => Ok(()),

            Err(e) if self.closable && is_closed(&e) => {
                debug!("sink {} is closed, dropping further {} output", self.sink, stream);
                self.state = State::Closed;
                Ok(())
            }

            Err(source) => {
                self.state = State::Failed;
                Err(Error::Sink {
                    sink: self.sink.0.name.clone(),
                    stream,
                    source,
                })
            }
        }
    }

    fn state_name(&self) -> &'static str {
        match self.state {
            State::Open => "open",
            State::Closed => "closed",
            State::Failed => "failed",
        }
    }
}
