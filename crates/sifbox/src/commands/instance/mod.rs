//! Named background instances of the calling user.
use anyhow::Result;
use clap::Subcommand;

pub mod list;
pub mod start;
pub mod stats;
pub mod stop;

#[derive(Subcommand, Debug)]
pub enum InstanceCmd {
    Start(start::Start),
    List(list::List),
    Stop(stop::Stop),
    Stats(stats::Stats),
}

pub fn instance(cmd: InstanceCmd) -> Result<i32> {
    match cmd {
        InstanceCmd::Start(args) => start::start(args),
        InstanceCmd::List(args) => list::list(args),
        InstanceCmd::Stop(args) => stop::stop(args),
        InstanceCmd::Stats(args) => stats::stats(args),
    }?;
    Ok(0)
}
