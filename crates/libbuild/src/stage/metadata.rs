//! Writes recipe sections into the container metadata tree once `%post` has
//! run, and lays out SCIF apps.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::files::copy_from_host;
use super::script::LABELS_PATH;
use super::StageError;
use crate::definition::{App, Definition, Script};
use crate::sources::base_env::{self, write_file};

const SCRIPT_HEADER: &str = "#!/bin/sh\n\n";
const ENVIRONMENT_HEADER: &str = "#!/bin/sh\n# Custom environment shell code should follow\n\n";
const APPS_ROOT: &str = "scif/apps";
const APPS_DATA: &str = "scif/data";

fn write(rootfs: &Path, rel: &str, content: &str, mode: u32) -> Result<(), StageError> {
    let path = rootfs.join(rel.trim_start_matches('/'));
    write_file(&path, content, mode, true).map_err(StageError::io(&path))
}

fn script_content(section: &Script) -> String {
    format!("{SCRIPT_HEADER}{}\n", section.body.trim_end())
}

/// Labels recorded by `%post` through `$SINGULARITY_LABELS`, one
/// `KEY VALUE` pair per line.
fn read_build_labels(path: &Path) -> BTreeMap<String, String> {
    let Ok(text) = fs::read_to_string(path) else {
        return BTreeMap::new();
    };
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| match line.split_once(char::is_whitespace) {
            Some((key, value)) => (key.to_owned(), value.trim().to_owned()),
            None => (line.to_owned(), String::new()),
        })
        .collect()
}

fn schema_labels(def: &Definition) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert("org.label-schema.schema-version".to_owned(), "1.0".to_owned());
    labels.insert(
        "org.label-schema.build-date".to_owned(),
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
    );
    labels.insert(
        "org.label-schema.build-arch".to_owned(),
        crate::config::oci_arch(std::env::consts::ARCH).to_owned(),
    );
    labels.insert(
        "org.label-schema.usage.sifbox.version".to_owned(),
        env!("CARGO_PKG_VERSION").to_owned(),
    );
    if let Some(bootstrap) = def.header_value("bootstrap") {
        labels.insert(
            "org.label-schema.usage.singularity.deffile.bootstrap".to_owned(),
            bootstrap.to_owned(),
        );
    }
    if let Some(from) = def.header_value("from") {
        labels.insert("org.label-schema.usage.singularity.deffile.from".to_owned(), from.to_owned());
    }
    labels
}

/// Merges labels from the source image, `%post`, `%labels` and build
/// metadata, later sources winning.
fn insert_labels(rootfs: &Path, def: &Definition) -> Result<(), StageError> {
    let path = rootfs.join(base_env::LABELS_FILE);
    let build_labels = rootfs.join(LABELS_PATH.trim_start_matches('/'));

    let mut labels = base_env::read_labels(&path);
    labels.extend(read_build_labels(&build_labels));
    labels.extend(def.sections.labels.iter().cloned());
    labels.extend(schema_labels(def));
    base_env::write_labels(&path, &labels).map_err(StageError::io(&path))?;

    match fs::remove_file(&build_labels) {
        Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(StageError::io(&build_labels)(err)),
        _ => Ok(()),
    }
}

/// Writes environment, scripts, help, labels, apps and the recipe text.
#[tracing::instrument(level = "debug", skip_all, fields(rootfs = ?rootfs))]
pub fn insert_metadata(rootfs: &Path, def: &Definition, recipe_raw: &str) -> Result<(), StageError> {
    let sections = &def.sections;
    if !sections.environment.is_empty() {
        let content = format!("{ENVIRONMENT_HEADER}{}\n", sections.environment.body.trim_end());
        write(rootfs, base_env::ENVIRONMENT_SCRIPT, &content, 0o755)?;
    }
    for (section, rel) in [
        (&sections.runscript, base_env::RUNSCRIPT),
        (&sections.startscript, base_env::STARTSCRIPT),
        (&sections.test, base_env::TESTSCRIPT),
    ] {
        if !section.is_empty() {
            write(rootfs, rel, &script_content(section), 0o755)?;
        }
    }
    if !sections.help.trim().is_empty() {
        write(rootfs, base_env::HELPFILE, &format!("{}\n", sections.help.trim_end()), 0o644)?;
    }
    insert_labels(rootfs, def)?;
    for (name, app) in &sections.apps {
        insert_app_metadata(rootfs, name, app)?;
    }
    write(rootfs, base_env::DEFFILE, recipe_raw, 0o644)
}

fn app_dir(name: &str) -> String {
    format!("{APPS_ROOT}/{name}")
}

fn app_base_env(name: &str) -> String {
    format!(
        "#!/bin/sh\n\
         SCIF_APPNAME={name}\n\
         SCIF_APPROOT=/{APPS_ROOT}/{name}\n\
         SCIF_APPDATA=/{APPS_DATA}/{name}\n\
         SCIF_APPBIN=/{APPS_ROOT}/{name}/bin\n\
         SCIF_APPLIB=/{APPS_ROOT}/{name}/lib\n\
         export SCIF_APPNAME SCIF_APPROOT SCIF_APPDATA SCIF_APPBIN SCIF_APPLIB\n\
         PATH=\"$SCIF_APPBIN:$PATH\"\n\
         LD_LIBRARY_PATH=\"$SCIF_APPLIB${{LD_LIBRARY_PATH:+:$LD_LIBRARY_PATH}}\"\n\
         export PATH LD_LIBRARY_PATH\n"
    )
}

/// Creates app directories and copies `%appfiles`, ahead of `%post` which
/// runs the `%appinstall` bodies.
pub fn prepare_apps(rootfs: &Path, def: &Definition) -> Result<(), StageError> {
    for (name, app) in &def.sections.apps {
        let root: PathBuf = rootfs.join(app_dir(name));
        for sub in ["bin", "lib", "scif/env"] {
            let dir = root.join(sub);
            fs::create_dir_all(&dir).map_err(StageError::io(&dir))?;
        }
        for sub in ["input", "output"] {
            let dir = rootfs.join(APPS_DATA).join(name).join(sub);
            fs::create_dir_all(&dir).map_err(StageError::io(&dir))?;
        }
        write(&root, "scif/env/01-base.sh", &app_base_env(name), 0o755)?;
        if !app.files.is_empty() {
            tracing::debug!(app = %name, "copying app files");
            copy_from_host(&app.files, &root)?;
        }
    }
    Ok(())
}

/// `%post` body followed by every `%appinstall`, each run from its app
/// directory in a subshell.
pub fn post_body(def: &Definition) -> String {
    let mut body = def.sections.post.body.clone();
    for (name, app) in &def.sections.apps {
        if app.install.is_empty() {
            continue;
        }
        if !body.is_empty() && !body.ends_with('\n') {
            body.push('\n');
        }
        body.push_str(&format!(
            "(\ncd /{}\n{}\n)\n",
            app_dir(name),
            app.install.body.trim_end()
        ));
    }
    body
}

fn insert_app_metadata(rootfs: &Path, name: &str, app: &App) -> Result<(), StageError> {
    let scif = rootfs.join(app_dir(name)).join("scif");
    if !app.env.is_empty() {
        let content = format!("{ENVIRONMENT_HEADER}{}\n", app.env.body.trim_end());
        write(&scif, "env/90-environment.sh", &content, 0o755)?;
    }
    for (section, file) in [(&app.run, "runscript"), (&app.start, "startscript"), (&app.test, "test")] {
        if !section.is_empty() {
            write(&scif, file, &script_content(section), 0o755)?;
        }
    }
    if !app.help.trim().is_empty() {
        write(&scif, "runscript.help", &format!("{}\n", app.help.trim_end()), 0o644)?;
    }
    let mut labels = BTreeMap::new();
    labels.insert("SCIF_APP_NAME".to_owned(), name.to_owned());
    labels.extend(app.labels.iter().cloned());
    let path = scif.join("labels.json");
    base_env::write_labels(&path, &labels).map_err(StageError::io(&path))
}
