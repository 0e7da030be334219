// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use crate::error::{Error, Result};
use crate::segment::Stream;
use crate::sink::{is_closed, is_unsupported, Callback, Options, Sink};
use crate::threads::Threads;

use std::process::{Child, Command, Stdio};

use log::{debug, trace};

/// Callbacks for the three partitions of a [`SinkGroup`]
///
/// `None` means the partition was never requested, which is different from
/// a partition that was requested but is empty.
#[derive(Debug, Default)]
pub struct Callbacks {
    pub out: Option<Vec<Callback>>,
    pub err: Option<Vec<Callback>>,
    pub both: Option<Vec<Callback>>,
}

/// Where the output of a process goes
///
/// Sinks requested for both stdout and stderr are moved into `both`, where
/// they receive a single merged stream instead of two independent ones. The
/// three partitions never share a sink.
#[derive(Clone, Debug, Default)]
pub struct SinkGroup {
    out: Option<Vec<Sink>>,
    err: Option<Vec<Sink>>,
    both: Vec<Sink>,
}

fn dedup(sinks: Vec<Sink>) -> Vec<Sink> {
    let mut unique: Vec<Sink> = Vec::with_capacity(sinks.len());
    for sink in sinks {
        if !unique.contains(&sink) {
            unique.push(sink);
        }
    }
    unique
}

fn callbacks(sinks: &[Sink], options: Options) -> Result<Vec<Callback>> {
    sinks.iter().map(|sink| sink.callback(options)).collect()
}

impl SinkGroup {
    /// Partitions the destinations for stdout and stderr
    pub fn new(out: Option<Vec<Sink>>, err: Option<Vec<Sink>>) -> Self {
        let mut out = out.map(dedup);
        let mut err = err.map(dedup);
        let mut both = Vec::new();

        if let (Some(o), Some(e)) = (out.as_mut(), err.as_mut()) {
            both = o.iter().filter(|s| e.contains(s)).cloned().collect();
            o.retain(|s| !both.contains(s));
            e.retain(|s| !both.contains(s));
        }

        trace!(
            "partitioned sinks: {} out, {} err, {} both",
            out.as_ref().map_or(0, Vec::len),
            err.as_ref().map_or(0, Vec::len),
            both.len()
        );

        Self { out, err, both }
    }

    pub fn out(&self) -> Option<&[Sink]> {
        self.out.as_deref()
    }

    pub fn err(&self) -> Option<&[Sink]> {
        self.err.as_deref()
    }

    pub fn both(&self) -> &[Sink] {
        &self.both
    }

    fn sinks(&self) -> impl Iterator<Item = &Sink> {
        let out = self.out.iter().flatten();
        let err = self.err.iter().flatten();
        out.chain(err).chain(self.both.iter())
    }

    /// Converts every partition into write callbacks
    ///
    /// This is where sinks without a write or put capability are rejected,
    /// before any thread has been started.
    pub fn as_callbacks(&self, options: Options) -> Result<Callbacks> {
        let out = self.out.as_deref().map(|s| callbacks(s, options)).transpose()?;
        let err = self.err.as_deref().map(|s| callbacks(s, options)).transpose()?;
        let both = if self.both.is_empty() {
            None
        } else {
            Some(callbacks(&self.both, options)?)
        };

        Ok(Callbacks { out, err, both })
    }

    /// Whether `stream` needs a pipe: it has at least one destination
    pub fn is_piped(&self, stream: Stream) -> bool {
        let direct = match stream {
            Stream::Stdout => &self.out,
            Stream::Stderr => &self.err,
        };

        !self.both.is_empty() || direct.as_ref().map_or(false, |s| !s.is_empty())
    }

    fn policy(&self, stream: Stream) -> Stdio {
        if self.is_piped(stream) {
            Stdio::piped()
        } else {
            Stdio::inherit()
        }
    }

    pub fn stdout_policy(&self) -> Stdio {
        self.policy(Stream::Stdout)
    }

    pub fn stderr_policy(&self) -> Stdio {
        self.policy(Stream::Stderr)
    }

    /// Flushes every sink that can be flushed
    pub fn flush_all(&self) -> Result<()> {
        for sink in self.sinks() {
            match sink.flush() {
                None | Some(Ok(())) => (),
                Some(Err(e)) if is_closed(&e) => debug!("not flushing closed sink {}", sink),
                Some(Err(source)) => {
                    return Err(Error::Flush {
                        sink: sink.name().into(),
                        source,
                    })
                }
            }
        }

        Ok(())
    }

    /// Rewinds every sink that can be rewound
    ///
    /// Sinks that turn out not to support seeking are left alone.
    pub fn reset_all(&self) -> Result<()> {
        for sink in self.sinks() {
            match sink.rewind() {
                None | Some(Ok(())) => (),
                Some(Err(e)) if is_unsupported(&e) => trace!("sink {} cannot seek", sink),
                Some(Err(source)) => {
                    return Err(Error::Rewind {
                        sink: sink.name().into(),
                        source,
                    })
                }
            }
        }

        Ok(())
    }

    /// Spawns `command` with pipes for every direction that has a destination
    ///
    /// Directions without destinations are inherited from this process.
    pub fn spawn(&self, command: &mut Command) -> Result<Child> {
        command
            .stdout(self.stdout_policy())
            .stderr(self.stderr_policy())
            .spawn()
            .map_err(Error::Spawn)
    }

    /// Starts the workers for a child spawned by [`SinkGroup::spawn`]
    pub fn make_threads(&self, child: &mut Child, options: Options) -> Result<Threads> {
        Threads::new(child, self.as_callbacks(options)?)
    }

    /// Tees the output of a running child until it closes its streams
    ///
    /// Sinks are flushed and rewound afterwards, even when a sink failed
    /// during the run. The first failure is returned.
    pub fn run_threads(&self, child: &mut Child, options: Options) -> Result<()> {
        let joined = self.make_threads(child, options)?.finish();
        let flushed = self.flush_all();
        let reset = self.reset_all();
        joined.and(flushed).and(reset)
    }

    /// Spawns `command` and tees its output
    ///
    /// Returns the child once both of its streams are exhausted; the caller
    /// collects its exit status.
    pub fn run(&self, command: &mut Command, options: Options) -> Result<Child> {
        // Reject unusable sinks before there is a process to clean up.
        self.as_callbacks(options)?;

        let mut child = self.spawn(command)?;
        debug!("spawned process {}", child.id());

        if let Err(e) = self.run_threads(&mut child, options) {
            debug!("reaping process {} after failure: {}", child.id(), e);
            let _ = child.wait();
            return Err(e);
        }

        Ok(child)
    }
}
