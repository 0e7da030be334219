// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

//! The worker threads of one process run
//!
//! Each stream that has somewhere to go gets its own thread, so a process
//! that fills its stderr pipe while we wait on stdout can never wedge us.
//! Sinks shared between the two streams are served by a third thread that
//! drains a queue both stream threads feed, which yields a single merged
//! stream in arrival order.

mod worker;

use crate::error::{Error, Result};
use crate::group::Callbacks;
use crate::segment::{Message, Stream};

use std::io::Read;
use std::process::Child;
use std::sync::mpsc::{channel, Sender};
use std::thread::{spawn, JoinHandle};

use log::{debug, trace, warn};

/// Which workers [`Threads::join`] waits for
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Selection {
    pub out: bool,
    pub err: bool,
    pub both: bool,
}

impl Selection {
    /// Only the merge worker
    pub const MERGE: Self = Self {
        out: false,
        err: false,
        both: true,
    };
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            out: true,
            err: true,
            both: false,
        }
    }
}

type Worker = JoinHandle<Result<()>>;

/// The running workers for one process
///
/// Dropping this ends the merge queue and waits for the merge worker, so no
/// thread outlives the scope it was created in without being told to stop.
/// Segments still in flight from stream workers that were never joined are
/// not delivered to the shared sinks in that case. A shared sink failure that
/// nobody collected is logged as a warning on drop.
#[derive(Debug)]
pub struct Threads {
    out: Option<Worker>,
    err: Option<Worker>,
    both: Option<Worker>,
    queue: Option<Sender<Message>>,
}

impl Drop for Threads {
    fn drop(&mut self) {
        self.end_termination();
        if let Some(thread) = self.both.take() {
            match thread.join() {
                Ok(Ok(())) => (),
                Ok(Err(e)) => warn!("{}, dropped with the merge worker", e),
                Err(..) => warn!("merge worker panicked"),
            }
        }
    }
}

fn reap(name: &'static str, thread: Option<Worker>) -> Result<()> {
    match thread {
        None => Ok(()),
        Some(thread) => {
            trace!("joining {} worker", name);
            thread.join().map_err(|_| Error::Panicked(name))?
        }
    }
}

impl Threads {
    /// Starts the workers for a child's piped streams
    ///
    /// The pipes are taken out of the child.
    pub fn new(child: &mut Child, callbacks: Callbacks) -> Result<Self> {
        Self::from_readers(child.stdout.take(), child.stderr.take(), callbacks)
    }

    /// Starts the workers over arbitrary readers
    pub fn from_readers<O, E>(stdout: Option<O>, stderr: Option<E>, callbacks: Callbacks) -> Result<Self>
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        let Callbacks { out, err, both } = callbacks;
        let both = both.filter(|b| !b.is_empty());
        let merging = both.is_some();

        if merging {
            if out.is_none() {
                return Err(Error::MissingDirect(Stream::Stdout));
            }
            if err.is_none() {
                return Err(Error::MissingDirect(Stream::Stderr));
            }
        }

        // A direction is active if it has direct sinks or feeds the merge.
        let out = out.filter(|c| merging || !c.is_empty());
        let err = err.filter(|c| merging || !c.is_empty());

        let stdout = match (out.is_some(), stdout) {
            (true, None) => return Err(Error::MissingPipe(Stream::Stdout)),
            (_, stdout) => stdout,
        };
        let stderr = match (err.is_some(), stderr) {
            (true, None) => return Err(Error::MissingPipe(Stream::Stderr)),
            (_, stderr) => stderr,
        };

        let mut queue = None;
        let both = both.map(|callbacks| {
            let (tx, rx) = channel();
            queue = Some(tx);
            debug!("starting merge worker for {} sinks", callbacks.len());
            spawn(move || worker::merge(rx, callbacks))
        });

        let out = out.zip(stdout).map(|(callbacks, reader)| {
            let merge = queue.clone();
            debug!("starting stdout worker for {} sinks", callbacks.len());
            spawn(move || worker::stream(reader, Stream::Stdout, callbacks, merge))
        });

        let err = err.zip(stderr).map(|(callbacks, reader)| {
            let merge = queue.clone();
            debug!("starting stderr worker for {} sinks", callbacks.len());
            spawn(move || worker::stream(reader, Stream::Stderr, callbacks, merge))
        });

        Ok(Self {
            out,
            err,
            both,
            queue,
        })
    }

    /// Waits for the selected workers to finish
    ///
    /// Joining the merge worker blocks until [`Threads::end_termination`] has
    /// been called. Every selected worker is joined even if one fails; the
    /// first failure is returned. Workers already joined are skipped.
    ///
    /// Shared sinks are written by the merge worker, so their failures are
    /// only returned by [`Threads::finish`] or by joining
    /// [`Selection::MERGE`] after ending the queue. The default selection
    /// never reports them.
    pub fn join(&mut self, which: Selection) -> Result<()> {
        let out = reap("stdout", which.out.then(|| self.out.take()).flatten());
        let err = reap("stderr", which.err.then(|| self.err.take()).flatten());
        let both = reap("merge", which.both.then(|| self.both.take()).flatten());
        out.and(err).and(both)
    }

    /// Tells the merge worker to stop once it has drained the queue
    ///
    /// Sends the termination marker at most once. Does nothing if there is
    /// no merge worker.
    pub fn end_termination(&mut self) {
        if let Some(queue) = self.queue.take() {
            trace!("ending merge queue");
            if queue.send(Message::End).is_err() {
                debug!("merge worker already gone");
            }
        }
    }

    /// Joins the stream workers, then stops and joins the merge worker
    pub fn finish(&mut self) -> Result<()> {
        let streams = self.join(Selection::default());
        self.end_termination();
        let merged = self.join(Selection::MERGE);
        streams.and(merged)
    }
}

#[cfg(test)]
mod test {
    use std::io::{self, Cursor, Read};
    use std::sync::mpsc::{channel, Receiver};
    use std::sync::{Arc, Mutex};

    use super::{Selection, Threads};
    use crate::error::Error;
    use crate::group::{Callbacks, SinkGroup};
    use crate::segment::Stream;
    use crate::sink::{Options, Sink};

    type Buffer = Arc<Mutex<Vec<u8>>>;

    fn buffer() -> (Buffer, Sink) {
        let data = Arc::new(Mutex::new(Vec::new()));
        (data.clone(), Sink::writer(data))
    }

    fn lines(prefix: &str, count: usize) -> Vec<u8> {
        (0..count)
            .map(|i| format!("{}{}\n", prefix, i))
            .collect::<String>()
            .into_bytes()
    }

    fn split(data: &Buffer) -> Vec<String> {
        String::from_utf8(data.lock().unwrap().clone())
            .unwrap()
            .split_inclusive('\n')
            .map(String::from)
            .collect()
    }

    /// A reader fed line by line from another thread
    struct Feed(Receiver<Vec<u8>>, Cursor<Vec<u8>>);

    impl Read for Feed {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let n = self.1.read(buf)?;
                if n > 0 {
                    return Ok(n);
                }
                match self.0.recv() {
                    Ok(next) => self.1 = Cursor::new(next),
                    Err(..) => return Ok(0),
                }
            }
        }
    }

    #[test]
    fn direct_sinks() {
        let (a, sink_a) = buffer();
        let (b, sink_b) = buffer();
        let group = SinkGroup::new(Some(vec![sink_a]), Some(vec![sink_b]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(lines("o", 500));
        let err = Cursor::new(lines("e", 300));
        let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();
        threads.finish().unwrap();

        assert_eq!(&*a.lock().unwrap(), &lines("o", 500));
        assert_eq!(&*b.lock().unwrap(), &lines("e", 300));
    }

    #[test]
    fn merged() {
        let (a, sink_a) = buffer();
        let (b, sink_b) = buffer();
        let (shared, sink_shared) = buffer();
        let group = SinkGroup::new(
            Some(vec![sink_a, sink_shared.clone()]),
            Some(vec![sink_b, sink_shared]),
        );
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(lines("o", 200));
        let err = Cursor::new(lines("e", 200));
        let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();
        threads.finish().unwrap();

        assert_eq!(&*a.lock().unwrap(), &lines("o", 200));
        assert_eq!(&*b.lock().unwrap(), &lines("e", 200));

        let merged = split(&shared);
        assert_eq!(merged.len(), 400);

        let outs: Vec<_> = merged.iter().filter(|l| l.starts_with('o')).cloned().collect();
        let errs: Vec<_> = merged.iter().filter(|l| l.starts_with('e')).cloned().collect();
        assert_eq!(outs.concat().into_bytes(), lines("o", 200));
        assert_eq!(errs.concat().into_bytes(), lines("e", 200));
    }

    #[test]
    fn arrival_order() {
        let (shared, sink) = buffer();
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let (otx, orx) = channel();
        let (etx, erx) = channel();
        let out = Feed(orx, Cursor::new(Vec::new()));
        let err = Feed(erx, Cursor::new(Vec::new()));
        let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();

        // Wait for each line to land before emitting the next one.
        let expected = ["1\n", "2\n", "3\n", "4\n"];
        for (i, line) in expected.iter().enumerate() {
            let tx = if i % 2 == 0 { &otx } else { &etx };
            tx.send(line.as_bytes().to_vec()).unwrap();
            while split(&shared).len() <= i {
                std::thread::yield_now();
            }
        }

        drop(otx);
        drop(etx);
        threads.finish().unwrap();
        assert_eq!(split(&shared), expected);
    }

    #[test]
    fn same_object_is_written_once() {
        let target = Arc::new(Mutex::new(Vec::new()));
        let group = SinkGroup::new(
            Some(vec![Sink::writer(target.clone())]),
            Some(vec![Sink::writer(target.clone())]),
        );
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(b"A\n".to_vec());
        let err = Cursor::new(b"B\n".to_vec());
        Threads::from_readers(Some(out), Some(err), callbacks)
            .unwrap()
            .finish()
            .unwrap();

        let data = target.lock().unwrap();
        assert_eq!(data.len(), 4);
        assert!(data[..] == b"A\nB\n"[..] || data[..] == b"B\nA\n"[..]);
    }

    #[test]
    fn both_without_direct() {
        let (_, sink) = buffer();
        let callbacks = Callbacks {
            out: None,
            err: Some(vec![]),
            both: Some(vec![sink.callback(Options::default()).unwrap()]),
        };

        let result = Threads::from_readers(Some(&b""[..]), Some(&b""[..]), callbacks);
        assert!(matches!(result, Err(Error::MissingDirect(Stream::Stdout))));
    }

    #[test]
    fn missing_pipe() {
        let (_, sink) = buffer();
        let group = SinkGroup::new(None, Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let result = Threads::from_readers(Some(&b""[..]), None::<&[u8]>, callbacks);
        assert!(matches!(result, Err(Error::MissingPipe(Stream::Stderr))));
    }

    #[test]
    fn nothing_to_do() {
        let group = SinkGroup::new(Some(vec![]), None);
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let mut threads = Threads::from_readers(None::<&[u8]>, None::<&[u8]>, callbacks).unwrap();
        threads.join(Selection::default()).unwrap();
        threads.end_termination();
    }

    #[test]
    fn sink_failure_is_reported() {
        let (a, good) = buffer();
        let bad = Sink::builder("bad")
            .write(|_| Err(io::Error::new(io::ErrorKind::Other, "nope")))
            .build();
        let group = SinkGroup::new(Some(vec![bad, good]), None);
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let mut threads =
            Threads::from_readers(Some(Cursor::new(lines("o", 10))), None::<&[u8]>, callbacks)
                .unwrap();

        match threads.finish() {
            Err(Error::Sink { sink, stream, .. }) => {
                assert_eq!(sink, "bad");
                assert_eq!(stream, Stream::Stdout);
            }
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(&*a.lock().unwrap(), &lines("o", 10));
    }

    #[test]
    fn termination_is_idempotent() {
        let (shared, sink) = buffer();
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(b"x\n".to_vec());
        let err = Cursor::new(b"y\n".to_vec());
        let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();
        threads.join(Selection::default()).unwrap();
        threads.end_termination();
        threads.end_termination();
        threads.join(Selection::MERGE).unwrap();
        threads.join(Selection::MERGE).unwrap();
        drop(threads);

        assert_eq!(split(&shared).len(), 2);
    }

    fn failing(name: &str, attempts: Arc<Mutex<usize>>) -> Sink {
        Sink::builder(name)
            .write(move |_| {
                *attempts.lock().unwrap() += 1;
                Err(io::Error::new(io::ErrorKind::Other, "disk full"))
            })
            .build()
    }

    #[test]
    fn shared_failure_comes_back_from_finish() {
        let attempts = Arc::new(Mutex::new(0));
        let sink = failing("shared", attempts.clone());
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(b"x\n".to_vec());
        let err = Cursor::new(b"y\n".to_vec());
        let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();

        // The stream workers themselves did nothing wrong.
        threads.join(Selection::default()).unwrap();

        match threads.finish() {
            Err(Error::Sink { sink, .. }) => assert_eq!(sink, "shared"),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[test]
    fn shared_failure_after_merge_join() {
        let attempts = Arc::new(Mutex::new(0));
        let sink = failing("shared", attempts);
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        let out = Cursor::new(b"x\n".to_vec());
        let mut threads = Threads::from_readers(Some(out), Some(&b""[..]), callbacks).unwrap();
        threads.join(Selection::default()).unwrap();
        threads.end_termination();
        assert!(matches!(
            threads.join(Selection::MERGE),
            Err(Error::Sink {
                stream: Stream::Stdout,
                ..
            })
        ));
    }

    #[test]
    fn shared_failure_at_scope_exit() {
        let attempts = Arc::new(Mutex::new(0));
        let sink = failing("shared", attempts.clone());
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));
        let callbacks = group.as_callbacks(Options::default()).unwrap();

        {
            let out = Cursor::new(b"x\n".to_vec());
            let err = Cursor::new(b"y\n".to_vec());
            let mut threads = Threads::from_readers(Some(out), Some(err), callbacks).unwrap();
            threads.join(Selection::default()).unwrap();
        }

        // The merge worker ran to completion before the scope was left.
        assert_eq!(*attempts.lock().unwrap(), 1);
    }

    #[test]
    fn scope_ends_merge_on_error() {
        let (shared, sink) = buffer();
        let group = SinkGroup::new(Some(vec![sink.clone()]), Some(vec![sink]));

        let run = || -> anyhow::Result<()> {
            let callbacks = group.as_callbacks(Options::default())?;
            let out = Cursor::new(b"x\n".to_vec());
            let err = Cursor::new(b"y\n".to_vec());
            let mut threads = Threads::from_readers(Some(out), Some(err), callbacks)?;
            threads.join(Selection::default())?;
            anyhow::bail!("caller gave up")
        };

        // Returns only because dropping the threads stopped the merge worker.
        assert!(run().is_err());
        assert_eq!(split(&shared).len(), 2);
    }
}
