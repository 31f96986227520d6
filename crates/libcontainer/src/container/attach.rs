use std::io::{self, Write};

use super::{Container, ContainerStatus};
use crate::error::LibcontainerError;
use crate::start_socket;

impl Container {
    /// Streams the container output into `out` until the container exits.
    pub fn attach<W: Write>(&mut self, out: &mut W) -> Result<u64, LibcontainerError> {
        self.refresh_status()?;
        if !matches!(self.status(), ContainerStatus::Created | ContainerStatus::Running) {
            return Err(self.incorrect_status("attach"));
        }
        let mut stream = start_socket::connect(&self.attach_socket_path())?;
        tracing::debug!(id = %self.id(), "attached");
        Ok(io::copy(&mut stream, out)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serial_test::serial;
    use std::fs;
    use std::thread;

    fn container(dir: &std::path::Path, status: ContainerStatus) -> Result<Container> {
        let root = dir.join("c1");
        fs::create_dir_all(&root)?;
        let mut container = Container::new("c1", status, Some(std::process::id() as i32), dir, &root)?;
        container.save()?;
        Ok(container)
    }

    #[test]
    #[serial]
    fn test_attach_copies_output() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut c = container(tmp.path(), ContainerStatus::Running)?;
        let listener = start_socket::bind(&c.attach_socket_path())?;
        let server = thread::spawn(move || -> io::Result<()> {
            let (mut stream, _) = listener.accept()?;
            stream.write_all(b"line one\nline two\n")
        });

        let mut out = Vec::new();
        let copied = c.attach(&mut out)?;
        server.join().map_err(|_| anyhow::anyhow!("server panicked"))??;
        assert_eq!(copied, 18);
        assert_eq!(out, b"line one\nline two\n");
        Ok(())
    }

    #[test]
    fn test_attach_stopped() -> Result<()> {
        let tmp = tempfile::tempdir()?;
        let mut c = container(tmp.path(), ContainerStatus::Stopped)?;
        assert!(matches!(
            c.attach(&mut io::sink()),
            Err(LibcontainerError::IncorrectStatus { op: "attach", .. })
        ));
        Ok(())
    }
}
