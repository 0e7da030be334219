// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use std::fmt::Display;
use std::io::{BufRead, Result};

/// One of the two output streams of a process
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Stream {
    Stdout,
    Stderr,
}

impl Display for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => f.write_str("stdout"),
            Self::Stderr => f.write_str("stderr"),
        }
    }
}

/// A line-terminated chunk of bytes read from one stream
///
/// This is the unit of delivery: a segment is handed to every sink whole. The
/// last segment of a stream lacks the terminator if the process did not write
/// one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub stream: Stream,
    pub bytes: Vec<u8>,
}

impl AsRef<[u8]> for Segment {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// An item travelling through the merge queue
#[derive(Debug)]
pub enum Message {
    Data(Segment),
    End,
}

/// Splits a blocking reader into segments
///
/// Yields `None` at end of stream. A read error is yielded once, after which
/// the iterator is exhausted.
#[derive(Debug)]
pub struct Segments<R: BufRead> {
    reader: R,
    stream: Stream,
    done: bool,
}

impl<R: BufRead> Segments<R> {
    pub fn new(reader: R, stream: Stream) -> Self {
        Self {
            reader,
            stream,
            done: false,
        }
    }
}

impl<R: BufRead> Iterator for Segments<R> {
    type Item = Result<Segment>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut bytes = Vec::new();
        match self.reader.read_until(b'\n', &mut bytes) {
            Ok(0) => {
                self.done = true;
                None
            }

            Ok(..) => Some(Ok(Segment {
                stream: self.stream,
                bytes,
            })),

            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
