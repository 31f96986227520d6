use std::io::{self, Write};
use std::path::PathBuf;

use serde::Serialize;
use tabwriter::TabWriter;

use super::InstanceFile;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ListedInstance<'a> {
    instance: &'a str,
    pid: i32,
    img: &'a str,
    ip: &'a str,
    log_err_path: &'a PathBuf,
    log_out_path: &'a PathBuf,
}

#[derive(Serialize)]
struct Listing<'a> {
    instances: Vec<ListedInstance<'a>>,
}

/// Writes the aligned `INSTANCE NAME  PID  IP  IMAGE` table.
pub fn render_table<W: Write>(instances: &[InstanceFile], out: W) -> io::Result<()> {
    let mut tab_writer = TabWriter::new(out);
    writeln!(&mut tab_writer, "INSTANCE NAME\tPID\tIP\tIMAGE")?;
    for instance in instances {
        writeln!(
            &mut tab_writer,
            "{}\t{}\t{}\t{}",
            instance.name, instance.pid, instance.ip, instance.image
        )?;
    }
    tab_writer.flush()
}

/// Writes `{"instances": [...]}`, pretty printed.
pub fn render_json<W: Write>(instances: &[InstanceFile], mut out: W) -> io::Result<()> {
    let listing = Listing {
        instances: instances
            .iter()
            .map(|i| ListedInstance {
                instance: &i.name,
                pid: i.pid,
                img: &i.image,
                ip: &i.ip,
                log_err_path: &i.log_err_path,
                log_out_path: &i.log_out_path,
            })
            .collect(),
    };
    serde_json::to_writer_pretty(&mut out, &listing)?;
    writeln!(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    fn instances() -> Vec<InstanceFile> {
        vec![
            InstanceFile {
                name: "db".to_owned(),
                pid: 4242,
                image: "/images/postgres.sif".to_owned(),
                log_out_path: PathBuf::from("/logs/db.out"),
                log_err_path: PathBuf::from("/logs/db.err"),
                ..Default::default()
            },
            InstanceFile {
                name: "webserver".to_owned(),
                pid: 17,
                ip: "10.22.0.2".to_owned(),
                image: "/images/nginx.sif".to_owned(),
                ..Default::default()
            },
        ]
    }

    #[test]
    fn test_render_table() -> Result<()> {
        let mut out = Vec::new();
        render_table(&instances(), &mut out)?;
        let text = String::from_utf8(out)?;
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("INSTANCE NAME  PID"));
        assert!(lines[1].starts_with("db             4242"));
        assert!(lines[2].contains("10.22.0.2"));
        let image_column = lines[0].find("IMAGE");
        assert_eq!(lines[1].find("/images/postgres.sif"), image_column);
        Ok(())
    }

    #[test]
    fn test_render_json() -> Result<()> {
        let mut out = Vec::new();
        render_json(&instances(), &mut out)?;
        let value: serde_json::Value = serde_json::from_slice(&out)?;
        let first = &value["instances"][0];
        assert_eq!(first["instance"], "db");
        assert_eq!(first["pid"], 4242);
        assert_eq!(first["img"], "/images/postgres.sif");
        assert_eq!(first["logErrPath"], "/logs/db.err");
        assert_eq!(value["instances"].as_array().map(Vec::len), Some(2));
        Ok(())
    }
}
