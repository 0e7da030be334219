// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use crate::segment::Stream;

/// Everything that can go wrong while teeing a process
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The sink can neither be written to nor put into
    #[error("unknown sink type for {0}: it has neither write nor put")]
    UnknownSink(String),

    /// Shared sinks were given without a direct callback set for `0`
    #[error("both is defined, but {0} is None")]
    MissingDirect(Stream),

    /// A direction has callbacks but the process has no pipe for it
    #[error("{0} has sinks, but no pipe to read from")]
    MissingPipe(Stream),

    #[error("failed to spawn process")]
    Spawn(#[source] std::io::Error),

    #[error("failed to read from {stream}")]
    Read {
        stream: Stream,
        #[source]
        source: std::io::Error,
    },

    /// A sink failed with something other than the closed condition
    #[error("sink {sink} failed while writing {stream}")]
    Sink {
        sink: String,
        stream: Stream,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to flush sink {sink}")]
    Flush {
        sink: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rewind sink {sink}")]
    Rewind {
        sink: String,
        #[source]
        source: std::io::Error,
    },

    #[error("the {0} worker panicked")]
    Panicked(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
