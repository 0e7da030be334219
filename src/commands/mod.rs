// SPDX-License-Identifier: Apache-2.0
// Copyright (C) 2021 Profian, Inc.

use structopt::StructOpt;

mod run;

pub trait Command {
    fn execute(self) -> anyhow::Result<()>;
}

#[derive(StructOpt, Debug)]
#[structopt(about = "tee for child processes")]
pub enum Main {
    Run(run::Run),
}

impl Command for Main {
    fn execute(self) -> anyhow::Result<()> {
        match self {
            Self::Run(cmd) => cmd.execute(),
        }
    }
}

/// Sends log records to stderr, more of them for every `-v`
fn logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(level)
        .with_writer(std::io::stderr)
        .with_target(verbose >= 2)
        .with_thread_ids(verbose >= 3)
        .init();
}
