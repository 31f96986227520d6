use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use crate::commands::load_container;

/// Execute a process within an existing container
#[derive(Parser, Debug)]
pub struct Exec {
    /// Current working directory of the process
    #[clap(long)]
    pub cwd: Option<PathBuf>,
    /// Environment variables that should be set in the container
    #[clap(short, long)]
    pub env: Vec<String>,
    /// Identifier of the container
    #[clap(required = true)]
    pub container_id: String,
    /// Command that should be executed in the container
    #[clap(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Returns the exit code of the executed process.
pub fn exec(args: Exec, root_path: PathBuf) -> Result<i32> {
    let mut container = load_container(&root_path, &args.container_id)?;
    let code = container.exec(&args.command, &args.env, args.cwd.as_deref())?;
    tracing::debug!(code, "process exited");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_keeps_its_flags() -> Result<()> {
        let args = Exec::try_parse_from(["exec", "-e", "A=1", "c1", "ls", "-la", "/"])?;
        assert_eq!(args.env, ["A=1"]);
        assert_eq!(args.command, ["ls", "-la", "/"]);
        assert!(Exec::try_parse_from(["exec", "c1"]).is_err());
        Ok(())
    }
}
