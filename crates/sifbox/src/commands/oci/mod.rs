//! OCI runtime commands. Containers live under the runtime root, one
//! directory per container id.
use std::path::PathBuf;

use anyhow::Result;
use clap::Subcommand;

use crate::rootpath;

pub mod attach;
pub mod create;
pub mod delete;
pub mod exec;
pub mod kill;
pub mod monitor;
pub mod pause;
pub mod resume;
pub mod start;
pub mod state;
pub mod update;

#[derive(Subcommand, Debug)]
pub enum OciCmd {
    Create(create::Create),
    Start(start::Start),
    State(state::State),
    Kill(kill::Kill),
    Pause(pause::Pause),
    Resume(resume::Resume),
    Delete(delete::Delete),
    Exec(exec::Exec),
    Update(update::Update),
    Attach(attach::Attach),
    #[clap(hide = true)]
    Monitor(monitor::Monitor),
}

pub fn oci(cmd: OciCmd, root: Option<PathBuf>) -> Result<i32> {
    let root_path = match cmd {
        // the monitor is handed its container directory directly
        OciCmd::Monitor(args) => return monitor::monitor(args),
        _ => rootpath::determine(root)?,
    };
    tracing::debug!(root = %root_path.display(), "using runtime root");
    match cmd {
        OciCmd::Create(args) => create::create(args, root_path)?,
        OciCmd::Start(args) => start::start(args, root_path)?,
        OciCmd::State(args) => state::state(args, root_path)?,
        OciCmd::Kill(args) => kill::kill(args, root_path)?,
        OciCmd::Pause(args) => pause::pause(args, root_path)?,
        OciCmd::Resume(args) => resume::resume(args, root_path)?,
        OciCmd::Delete(args) => delete::delete(args, root_path)?,
        OciCmd::Exec(args) => return exec::exec(args, root_path),
        OciCmd::Update(args) => update::update(args, root_path)?,
        OciCmd::Attach(args) => attach::attach(args, root_path)?,
        OciCmd::Monitor(args) => return monitor::monitor(args),
    }
    Ok(0)
}
