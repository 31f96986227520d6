//! Parsed form of a build recipe. A recipe is a sequence of stages, each with a
//! header (`Key: value` lines) followed by `%section` blocks.
mod parser;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use parser::{parse, parse_unresolved, resolve_stages};
pub(crate) use parser::split_stages;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("empty definition file")]
    Empty,
    #[error("line {line}: malformed header line {text:?}, expected 'Key: value'")]
    MalformedHeader { line: usize, text: String },
    #[error("line {line}: invalid arguments {args:?} for section %{section}")]
    BadSectionArgs {
        line: usize,
        section: String,
        args: String,
    },
    #[error("line {line}: %files entry {text:?} has more than a source and a destination")]
    MalformedFiles { line: usize, text: String },
    #[error("line {line}: unterminated quote in {text:?}")]
    UnterminatedQuote { line: usize, text: String },
    #[error("stage {index} has no 'Stage:' name, only the first stage may omit it")]
    MissingStageName { index: usize },
    #[error("multiple stages named {0:?}")]
    DuplicateStage(String),
    #[error("%files from {0:?} references an unknown stage")]
    UnknownStage(String),
    #[error("%files from {from:?} in stage {stage:?} must reference an earlier stage")]
    ForwardStageReference { stage: String, from: String },
    #[error("missing 'Bootstrap:' header")]
    MissingBootstrap,
    #[error("unknown bootstrap kind {0:?}")]
    UnknownBootstrap(String),
    #[error("bootstrap {bootstrap} requires a '{key}:' header")]
    MissingHeader {
        bootstrap: &'static str,
        key: &'static str,
    },
    #[error("invalid source uri {0:?}")]
    InvalidUri(String),
}

/// Source kinds a stage can start from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bootstrap {
    /// Registry image, `docker` or `oci`
    Registry,
    LocalImage,
    Http,
    Https,
    Scratch,
}

impl Bootstrap {
    pub fn as_str(&self) -> &'static str {
        match self {
            Bootstrap::Registry => "docker",
            Bootstrap::LocalImage => "localimage",
            Bootstrap::Http => "http",
            Bootstrap::Https => "https",
            Bootstrap::Scratch => "scratch",
        }
    }
}

impl fmt::Display for Bootstrap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Bootstrap {
    type Err = DefinitionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" | "oci" => Ok(Bootstrap::Registry),
            "localimage" => Ok(Bootstrap::LocalImage),
            "http" => Ok(Bootstrap::Http),
            "https" => Ok(Bootstrap::Https),
            "scratch" => Ok(Bootstrap::Scratch),
            other => Err(DefinitionError::UnknownBootstrap(other.to_owned())),
        }
    }
}

/// A scriptlet section body and the arguments written after its name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Script {
    pub args: String,
    pub body: String,
}

impl Script {
    pub fn is_empty(&self) -> bool {
        self.body.trim().is_empty()
    }

    pub(crate) fn append(&mut self, args: &str, body: &str) {
        if self.args.is_empty() {
            self.args = args.to_owned();
        }
        if self.body.is_empty() {
            self.body = body.to_owned();
        } else if !body.is_empty() {
            self.body.push('\n');
            self.body.push_str(body);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    pub src: String,
    pub dst: String,
}

/// One `%files` block. `from` names the stage the sources are read from;
/// `from_stage` is its index once the recipe has been resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilesSection {
    pub from: Option<String>,
    pub from_stage: Option<usize>,
    pub transfers: Vec<FileTransfer>,
}

/// Sections of an `app*` family sharing one app name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct App {
    pub install: Script,
    pub files: Vec<FileTransfer>,
    pub env: Script,
    pub run: Script,
    pub start: Script,
    pub test: Script,
    pub labels: Vec<(String, String)>,
    pub help: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sections {
    pub arguments: Script,
    pub pre: Script,
    pub setup: Script,
    pub post: Script,
    pub test: Script,
    pub runscript: Script,
    pub startscript: Script,
    pub environment: Script,
    pub labels: Vec<(String, String)>,
    pub help: String,
    pub files: Vec<FilesSection>,
    pub apps: BTreeMap<String, App>,
    /// Sections with names the builder does not interpret, kept verbatim.
    pub custom: BTreeMap<String, String>,
}

/// One build stage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Definition {
    /// Header keys are stored lower case.
    pub header: BTreeMap<String, String>,
    pub sections: Sections,
    /// Text of this stage exactly as it appeared in the recipe.
    pub raw: String,
}

impl Definition {
    pub fn header_value(&self, key: &str) -> Option<&str> {
        self.header
            .get(&key.to_ascii_lowercase())
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    pub fn stage_name(&self) -> Option<&str> {
        self.header_value("stage")
    }

    pub fn bootstrap(&self) -> Result<Bootstrap, DefinitionError> {
        self.header_value("bootstrap")
            .ok_or(DefinitionError::MissingBootstrap)?
            .parse()
    }

    /// Source reference for the stage, `From:` for most kinds.
    pub fn source(&self) -> Result<Option<&str>, DefinitionError> {
        let bootstrap = self.bootstrap()?;
        match bootstrap {
            Bootstrap::Scratch => Ok(None),
            _ => self
                .header_value("from")
                .map(Some)
                .ok_or(DefinitionError::MissingHeader {
                    bootstrap: bootstrap.as_str(),
                    key: "From",
                }),
        }
    }

    /// Builds a single stage definition for a `kind://ref` source given on the
    /// command line instead of a recipe file.
    pub fn from_uri(uri: &str) -> Result<Self, DefinitionError> {
        let (kind, rest) = uri
            .split_once("://")
            .ok_or_else(|| DefinitionError::InvalidUri(uri.to_owned()))?;
        let bootstrap: Bootstrap = kind.parse()?;
        let from = match bootstrap {
            Bootstrap::Http | Bootstrap::Https => uri.to_owned(),
            _ => rest.to_owned(),
        };
        if from.is_empty() && bootstrap != Bootstrap::Scratch {
            return Err(DefinitionError::InvalidUri(uri.to_owned()));
        }

        let mut header = BTreeMap::new();
        header.insert("bootstrap".to_owned(), kind.to_ascii_lowercase());
        if bootstrap != Bootstrap::Scratch {
            header.insert("from".to_owned(), from.clone());
        }
        let raw = if bootstrap == Bootstrap::Scratch {
            format!("bootstrap: {kind}\n")
        } else {
            format!("bootstrap: {kind}\nfrom: {from}\n")
        };
        Ok(Definition {
            header,
            sections: Sections::default(),
            raw,
        })
    }
}

/// All stages of a recipe with stage references resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Recipe {
    pub stages: Vec<Definition>,
    /// Concatenated raw text of every stage, stored in the image.
    pub raw: String,
}

impl Recipe {
    pub fn last(&self) -> Option<&Definition> {
        self.stages.last()
    }

    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages
            .iter()
            .position(|s| s.stage_name() == Some(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_from_str() {
        assert_eq!("Docker".parse::<Bootstrap>().unwrap(), Bootstrap::Registry);
        assert_eq!("oci".parse::<Bootstrap>().unwrap(), Bootstrap::Registry);
        assert_eq!(
            "localimage".parse::<Bootstrap>().unwrap(),
            Bootstrap::LocalImage
        );
        assert_eq!(
            "yum".parse::<Bootstrap>(),
            Err(DefinitionError::UnknownBootstrap("yum".into()))
        );
    }

    #[test]
    fn test_from_uri() {
        let def = Definition::from_uri("docker://alpine:3.17").unwrap();
        assert_eq!(def.bootstrap().unwrap(), Bootstrap::Registry);
        assert_eq!(def.source().unwrap(), Some("alpine:3.17"));

        let def = Definition::from_uri("https://example.org/img.sif").unwrap();
        assert_eq!(def.source().unwrap(), Some("https://example.org/img.sif"));

        assert!(Definition::from_uri("alpine").is_err());
        assert!(Definition::from_uri("docker://").is_err());
    }

    #[test]
    fn test_source_requires_from() {
        let mut def = Definition::default();
        def.header.insert("bootstrap".into(), "docker".into());
        assert!(matches!(
            def.source(),
            Err(DefinitionError::MissingHeader { key: "From", .. })
        ));
        def.header.insert("bootstrap".into(), "scratch".into());
        assert_eq!(def.source().unwrap(), None);
    }

    #[test]
    fn test_script_append() {
        let mut script = Script::default();
        script.append("-c /bin/bash", "echo one");
        script.append("", "echo two");
        assert_eq!(script.args, "-c /bin/bash");
        assert_eq!(script.body, "echo one\necho two");
    }
}
