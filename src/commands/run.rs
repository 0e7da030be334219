// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use super::Command;

use std::ffi::OsString;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::{debug, info};
use structopt::clap::AppSettings;
use structopt::StructOpt;
use teetime::{Options, Sink, SinkGroup};

/// Runs a program, copying its output to the terminal and to files
#[derive(StructOpt, Debug)]
#[structopt(setting = AppSettings::TrailingVarArg)]
pub struct Run {
    /// A file to copy stdout into
    #[structopt(short, long, number_of_values = 1, parse(from_os_str))]
    out: Vec<PathBuf>,

    /// A file to copy stderr into
    #[structopt(short, long, number_of_values = 1, parse(from_os_str))]
    err: Vec<PathBuf>,

    /// A file to copy stdout and stderr into, merged
    #[structopt(short, long, number_of_values = 1, parse(from_os_str))]
    both: Vec<PathBuf>,

    /// Don't copy output to the terminal (streams without files still reach it)
    #[structopt(short, long)]
    quiet: bool,

    /// Don't flush sinks after every line
    #[structopt(long)]
    no_flush: bool,

    /// Append to the files instead of truncating them
    #[structopt(short, long)]
    append: bool,

    /// More logging (repeatable)
    #[structopt(short, long, parse(from_occurrences))]
    verbose: u8,

    /// The program to run, followed by its arguments
    #[structopt(required = true, allow_hyphen_values = true, parse(from_os_str))]
    command: Vec<OsString>,
}

impl Run {
    /// Opens a file sink, reusing the sink if the path was already opened
    fn open(&self, path: &Path, opened: &mut Vec<(PathBuf, Sink)>) -> Result<Sink> {
        if let Some((_, sink)) = opened.iter().find(|(p, _)| p == path) {
            return Ok(sink.clone());
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(path)
            .with_context(|| format!("unable to open {:?}", path))?;

        let sink = Sink::builder(path.display().to_string())
            .seekable(Arc::new(Mutex::new(file)))
            .build();

        opened.push((path.to_path_buf(), sink.clone()));
        Ok(sink)
    }

    /// Builds the destinations: terminal echo plus every requested file
    ///
    /// A path named more than once is opened once, so naming it for both
    /// streams yields a single merged file.
    fn sinks(&self) -> Result<SinkGroup> {
        let mut opened = Vec::new();
        let mut out = Vec::new();
        let mut err = Vec::new();

        if !self.quiet {
            out.push(Sink::stdout());
            err.push(Sink::stderr());
        }

        for path in &self.out {
            out.push(self.open(path, &mut opened)?);
        }

        for path in &self.err {
            err.push(self.open(path, &mut opened)?);
        }

        for path in &self.both {
            let sink = self.open(path, &mut opened)?;
            out.push(sink.clone());
            err.push(sink);
        }

        let requested = |sinks: Vec<Sink>| Some(sinks).filter(|s| !s.is_empty());
        Ok(SinkGroup::new(requested(out), requested(err)))
    }

    /// Runs the program to completion; the files are closed on return
    fn tee(&self) -> Result<ExitStatus> {
        let sinks = self.sinks()?;
        let options = Options {
            flush: !self.no_flush,
            closable: true,
        };

        let mut command = std::process::Command::new(&self.command[0]);
        command.args(&self.command[1..]);

        info!("running {:?}", self.command);
        let mut child = sinks
            .run(&mut command, options)
            .with_context(|| format!("unable to run {:?}", self.command[0]))?;

        let status = child.wait().context("unable to wait for the process")?;
        debug!("process exited: {}", status);
        Ok(status)
    }
}

impl Command for Run {
    fn execute(self) -> Result<()> {
        super::logging(self.verbose);

        let status = self.tee()?;
        if !status.success() {
            std::process::exit(status.code().unwrap_or(1));
        }

        Ok(())
    }
}
