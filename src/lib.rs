// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

//! tee for child processes
//!
//! Copies the stdout and stderr of a child process to any number of sinks.
//! A sink requested for both streams receives one merged stream, in the
//! order the segments arrived, instead of two independent copies.
//!
//! ```no_run
//! use std::fs::File;
//! use std::process::Command;
//! use std::sync::{Arc, Mutex};
//!
//! use teetime::Sink;
//!
//! let log = Sink::seekable(Arc::new(Mutex::new(File::create("log.txt")?)));
//! let mut child = teetime::run(
//!     Command::new("make").arg("all"),
//!     vec![Sink::stdout(), log.clone()],
//!     vec![Sink::stderr(), log],
//! )?;
//! let status = child.wait()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! [`teetime::run`](run) is a convenience over [`SinkGroup`]. To interact
//! with the process while it runs, drive the pieces yourself:
//!
//! ```no_run
//! # use std::process::Command;
//! # use teetime::{Options, Sink, SinkGroup};
//! let sinks = SinkGroup::new(Some(vec![Sink::stdout()]), Some(vec![Sink::stderr()]));
//! let mut child = sinks.spawn(&mut Command::new("make"))?;
//! {
//!     let mut threads = sinks.make_threads(&mut child, Options::default())?;
//!     threads.finish()?;
//! }
//! sinks.flush_all()?;
//! sinks.reset_all()?;
//! # Ok::<(), teetime::Error>(())
//! ```

mod error;
mod group;
mod segment;
mod sink;
mod threads;

pub use error::{Error, Result};
pub use group::{Callbacks, SinkGroup};
pub use segment::{Message, Segment, Segments, Stream};
pub use sink::{Builder, Callback, Options, Sink};
pub use threads::{Selection, Threads};

use std::process::{Child, Command};

/// Runs `command`, teeing its output until both streams are exhausted
///
/// An empty list leaves that stream attached to this process. The returned
/// child has not been waited on.
pub fn run(command: &mut Command, stdout: Vec<Sink>, stderr: Vec<Sink>) -> Result<Child> {
    fn requested(sinks: Vec<Sink>) -> Option<Vec<Sink>> {
        Some(sinks).filter(|s| !s.is_empty())
    }

    SinkGroup::new(requested(stdout), requested(stderr)).run(command, Options::default())
}
