// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use crate::error::{Error, Result};
use crate::segment::{Message, Segment, Segments, Stream};
use crate::sink::Callback;

use std::io::{BufReader, Read};
use std::sync::mpsc::{Receiver, Sender};

use log::{debug, trace, warn};

fn dispatch(callbacks: &mut [Callback], segment: &Segment, first: &mut Option<Error>) {
    for callback in callbacks.iter_mut() {
        if let Err(e) = callback.call(&segment.bytes, segment.stream) {
            warn!("{}, no further output goes to it", e);
            if first.is_none() {
                *first = Some(e);
            }
        }
    }
}

/// Copies one stream into its sinks until the stream ends
///
/// Every segment goes to the direct callbacks first and then, if there is a
/// merge queue, onto the queue. A failing sink does not stop the stream from
/// being drained. A read error does: the reader is dropped on return, which
/// closes the pipe, so a process still writing to it gets `EPIPE` instead of
/// blocking.
pub fn stream<R: Read>(
    reader: R,
    stream: Stream,
    mut callbacks: Vec<Callback>,
    mut merge: Option<Sender<Message>>,
) -> Result<()> {
    let mut first = None;

    for segment in Segments::new(BufReader::new(reader), stream) {
        let segment = match segment {
            Ok(segment) => segment,
            Err(source) => {
                warn!("failed reading {}: {}", stream, source);
                if first.is_none() {
                    first = Some(Error::Read { stream, source });
                }
                break;
            }
        };

        dispatch(&mut callbacks, &segment, &mut first);

        if let Some(queue) = merge.as_ref() {
            if queue.send(Message::Data(segment)).is_err() {
                debug!("merge queue is gone, {} is no longer merged", stream);
                merge = None;
            }
        }
    }

    trace!("{} reached end of stream", stream);
    first.map_or(Ok(()), Err)
}

/// Copies merged segments into the shared sinks until told to stop
pub fn merge(queue: Receiver<Message>, mut callbacks: Vec<Callback>) -> Result<()> {
    let mut first = None;

    for message in queue.iter() {
        match message {
            Message::Data(segment) => dispatch(&mut callbacks, &segment, &mut first),
            Message::End => break,
        }
    }

    trace!("merge queue ended");
    first.map_or(Ok(()), Err)
}
