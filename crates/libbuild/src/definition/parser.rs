use std::collections::HashSet;

use super::{App, Definition, DefinitionError, FileTransfer, FilesSection, Recipe};

const SCRIPT_SECTIONS: &[&str] = &[
    "arguments",
    "pre",
    "setup",
    "post",
    "test",
    "runscript",
    "startscript",
    "environment",
];

const APP_SECTIONS: &[&str] = &[
    "appinstall",
    "appfiles",
    "appenv",
    "apprun",
    "applabels",
    "apphelp",
    "apptest",
    "appstart",
];

/// Parses a recipe, validates stage names and resolves `%files from` references.
pub fn parse(text: &str) -> Result<Recipe, DefinitionError> {
    let mut stages = parse_unresolved(text)?;
    if stages.is_empty() {
        return Err(DefinitionError::Empty);
    }
    resolve_stages(&mut stages)?;
    let raw = stages.iter().map(|s| s.raw.as_str()).collect();
    Ok(Recipe { stages, raw })
}

/// Splits a recipe into stages without checking cross-stage references.
pub fn parse_unresolved(text: &str) -> Result<Vec<Definition>, DefinitionError> {
    let mut stages = Vec::new();
    let mut current = StageBuilder::default();

    for (idx, line) in text.split_inclusive('\n').enumerate() {
        let lineno = idx + 1;
        let content = line.trim_end_matches(&['\n', '\r'][..]);

        if is_bootstrap_line(content) && current.has_content() {
            if let Some(stage) = std::mem::take(&mut current).finish()? {
                stages.push(stage);
            }
        }
        current.def.raw.push_str(line);

        if let Some((name, args)) = section_start(content) {
            current.close_section()?;
            current.section = Some(OpenSection {
                name,
                args,
                line: lineno,
                body: Vec::new(),
            });
            current.seen_section = true;
            continue;
        }

        if let Some(section) = current.section.as_mut() {
            section.body.push(content.to_owned());
            continue;
        }

        let trimmed = content.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let (key, value) = header_line(trimmed).ok_or_else(|| DefinitionError::MalformedHeader {
            line: lineno,
            text: trimmed.to_owned(),
        })?;
        current.def.header.insert(key, value);
    }

    if let Some(stage) = current.finish()? {
        stages.push(stage);
    }
    Ok(stages)
}

/// Raw text of one stage and the body of its `%arguments` sections.
#[derive(Debug, Default)]
pub(crate) struct RawStage {
    pub raw: String,
    pub arguments: String,
}

/// Splits a recipe on stage boundaries only. Used before build variables are
/// expanded, when section arguments may still hold placeholders.
pub(crate) fn split_stages(text: &str) -> Vec<RawStage> {
    let mut stages = Vec::new();
    let mut current = RawStage::default();
    let mut has_content = false;
    let mut in_arguments = false;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(&['\n', '\r'][..]);
        if is_bootstrap_line(content) && has_content {
            stages.push(std::mem::take(&mut current));
            in_arguments = false;
        }
        current.raw.push_str(line);

        if let Some((name, _)) = section_start(content) {
            in_arguments = name == "arguments";
            has_content = true;
        } else if in_arguments {
            current.arguments.push_str(line);
        } else if !content.trim().is_empty() && !content.trim().starts_with('#') {
            has_content = true;
        }
    }
    if !current.raw.is_empty() {
        stages.push(current);
    }
    stages
}

/// Checks stage naming rules and records the index of every `%files from` stage.
pub fn resolve_stages(stages: &mut [Definition]) -> Result<(), DefinitionError> {
    let mut names = HashSet::new();
    for (index, stage) in stages.iter().enumerate() {
        if stage.header_value("bootstrap").is_none() {
            return Err(DefinitionError::MissingBootstrap);
        }
        match stage.stage_name() {
            Some(name) => {
                if !names.insert(name.to_owned()) {
                    return Err(DefinitionError::DuplicateStage(name.to_owned()));
                }
            }
            None if index > 0 => return Err(DefinitionError::MissingStageName { index }),
            None => {}
        }
    }

    let lookup: Vec<Option<String>> = stages
        .iter()
        .map(|s| s.stage_name().map(str::to_owned))
        .collect();
    for (index, stage) in stages.iter_mut().enumerate() {
        let stage_name = lookup[index].clone().unwrap_or_default();
        for files in stage.sections.files.iter_mut() {
            let Some(from) = files.from.as_deref() else {
                continue;
            };
            let source = lookup
                .iter()
                .position(|n| n.as_deref() == Some(from))
                .ok_or_else(|| DefinitionError::UnknownStage(from.to_owned()))?;
            if source >= index {
                return Err(DefinitionError::ForwardStageReference {
                    stage: stage_name,
                    from: from.to_owned(),
                });
            }
            files.from_stage = Some(source);
        }
    }
    Ok(())
}

#[derive(Default)]
struct OpenSection {
    name: String,
    args: String,
    line: usize,
    body: Vec<String>,
}

#[derive(Default)]
struct StageBuilder {
    def: Definition,
    section: Option<OpenSection>,
    seen_section: bool,
}

impl StageBuilder {
    fn has_content(&self) -> bool {
        !self.def.header.is_empty() || self.seen_section
    }

    fn finish(mut self) -> Result<Option<Definition>, DefinitionError> {
        self.close_section()?;
        if !self.has_content() {
            return Ok(None);
        }
        Ok(Some(self.def))
    }

    fn close_section(&mut self) -> Result<(), DefinitionError> {
        let Some(section) = self.section.take() else {
            return Ok(());
        };
        let body = normalize_body(&section.body);
        let sections = &mut self.def.sections;
        let name = section.name.as_str();

        if SCRIPT_SECTIONS.contains(&name) {
            let script = match name {
                "arguments" => &mut sections.arguments,
                "pre" => &mut sections.pre,
                "setup" => &mut sections.setup,
                "post" => &mut sections.post,
                "test" => &mut sections.test,
                "runscript" => &mut sections.runscript,
                "startscript" => &mut sections.startscript,
                _ => &mut sections.environment,
            };
            script.append(&section.args, &body);
            return Ok(());
        }

        match name {
            "labels" => sections.labels.extend(parse_labels(&body)),
            "help" => append_text(&mut sections.help, &body),
            "files" => {
                let from = files_source(&section)?;
                let transfers = parse_transfers(&section)?;
                sections.files.push(FilesSection {
                    from,
                    from_stage: None,
                    transfers,
                });
            }
            _ if APP_SECTIONS.contains(&name) => {
                let app_name = app_name(&section)?;
                let app = sections.apps.entry(app_name).or_insert_with(App::default);
                match name {
                    "appinstall" => app.install.append("", &body),
                    "appfiles" => app.files.extend(parse_transfers(&section)?),
                    "appenv" => app.env.append("", &body),
                    "apprun" => app.run.append("", &body),
                    "appstart" => app.start.append("", &body),
                    "apptest" => app.test.append("", &body),
                    "applabels" => app.labels.extend(parse_labels(&body)),
                    _ => append_text(&mut app.help, &body),
                }
            }
            _ => append_text(sections.custom.entry(section.name.clone()).or_default(), &body),
        }
        Ok(())
    }
}

fn append_text(target: &mut String, body: &str) {
    if !target.is_empty() && !body.is_empty() {
        target.push('\n');
    }
    target.push_str(body);
}

fn is_bootstrap_line(line: &str) -> bool {
    if line.starts_with(char::is_whitespace) {
        return false;
    }
    matches!(line.split_once(':'), Some((key, _)) if key.trim().eq_ignore_ascii_case("bootstrap"))
}

/// `%name args` at column zero.
fn section_start(line: &str) -> Option<(String, String)> {
    let rest = line.strip_prefix('%')?;
    if !rest.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return None;
    }
    let (name, args) = match rest.find(char::is_whitespace) {
        Some(pos) => (&rest[..pos], rest[pos..].trim()),
        None => (rest, ""),
    };
    Some((name.to_ascii_lowercase(), args.to_owned()))
}

fn header_line(line: &str) -> Option<(String, String)> {
    let (key, value) = line.split_once(':')?;
    let key = key.trim();
    if key.is_empty()
        || !key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((key.to_ascii_lowercase(), value.trim().to_owned()))
}

fn normalize_body(lines: &[String]) -> String {
    let start = lines
        .iter()
        .position(|l| !l.trim().is_empty())
        .unwrap_or(lines.len());
    lines[start..].join("\n").trim_end().to_owned()
}

fn strip_comment(args: &str) -> &str {
    args.split('#').next().unwrap_or_default().trim()
}

fn files_source(section: &OpenSection) -> Result<Option<String>, DefinitionError> {
    let tokens: Vec<&str> = strip_comment(&section.args).split_whitespace().collect();
    match tokens.as_slice() {
        [] => Ok(None),
        ["from", stage] => Ok(Some((*stage).to_owned())),
        _ => Err(bad_args(section)),
    }
}

fn app_name(section: &OpenSection) -> Result<String, DefinitionError> {
    let tokens: Vec<&str> = strip_comment(&section.args).split_whitespace().collect();
    match tokens.as_slice() {
        [name] => Ok((*name).to_owned()),
        _ => Err(bad_args(section)),
    }
}

fn bad_args(section: &OpenSection) -> DefinitionError {
    DefinitionError::BadSectionArgs {
        line: section.line,
        section: section.name.clone(),
        args: section.args.clone(),
    }
}

/// `key value` per line, value being the rest of the line.
fn parse_labels(body: &str) -> Vec<(String, String)> {
    body.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|l| match l.find(char::is_whitespace) {
            Some(pos) => (l[..pos].to_owned(), l[pos..].trim().to_owned()),
            None => (l.to_owned(), String::new()),
        })
        .collect()
}

fn parse_transfers(section: &OpenSection) -> Result<Vec<FileTransfer>, DefinitionError> {
    let mut transfers = Vec::new();
    for (offset, line) in section.body.iter().enumerate() {
        let lineno = section.line + 1 + offset;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let fields = split_fields(trimmed).ok_or_else(|| DefinitionError::UnterminatedQuote {
            line: lineno,
            text: trimmed.to_owned(),
        })?;
        match fields.as_slice() {
            [] => {}
            [src] => transfers.push(FileTransfer {
                src: src.clone(),
                dst: src.clone(),
            }),
            [src, dst] => transfers.push(FileTransfer {
                src: src.clone(),
                dst: dst.clone(),
            }),
            _ => {
                return Err(DefinitionError::MalformedFiles {
                    line: lineno,
                    text: trimmed.to_owned(),
                })
            }
        }
    }
    Ok(transfers)
}

/// Shell-like field splitting: quotes and backslashes protect whitespace,
/// wildcards are left for glob expansion. `None` on an unterminated quote.
pub(crate) fn split_fields(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_field = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some('"') if c == '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_field = true;
                }
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                    in_field = true;
                }
                '#' if !in_field => break,
                c if c.is_whitespace() => {
                    if in_field {
                        fields.push(std::mem::take(&mut current));
                        in_field = false;
                    }
                }
                c => {
                    current.push(c);
                    in_field = true;
                }
            },
        }
    }

    if quote.is_some() {
        return None;
    }
    if in_field {
        fields.push(current);
    }
    Some(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::Bootstrap;

    const MULTI_STAGE: &str = "\
# builder stage
Bootstrap: docker
From: golang:1.21
Stage: build

%post
    # compile
    go build -o /app ./...

Bootstrap: docker
From: alpine:3.17
Stage: final

%files from build
    /app /usr/local/bin/app

%files
    'my file.txt' /opt/
    data/*.csv

%environment
    export LANG=C

%labels
    Author someone
    Version v1.0 beta

%runscript
    exec /usr/local/bin/app \"$@\"
";

    #[test]
    fn test_parse_multi_stage() {
        let recipe = parse(MULTI_STAGE).unwrap();
        assert_eq!(recipe.stages.len(), 2);
        assert_eq!(recipe.raw, MULTI_STAGE);

        let build = &recipe.stages[0];
        assert_eq!(build.stage_name(), Some("build"));
        assert_eq!(build.bootstrap().unwrap(), Bootstrap::Registry);
        assert_eq!(build.source().unwrap(), Some("golang:1.21"));
        assert_eq!(
            build.sections.post.body,
            "    # compile\n    go build -o /app ./..."
        );
        assert!(build.raw.starts_with("# builder stage\n"));

        let last = &recipe.stages[1];
        assert!(last.raw.starts_with("Bootstrap: docker\nFrom: alpine:3.17"));
        assert_eq!(last.sections.files.len(), 2);
        assert_eq!(last.sections.files[0].from.as_deref(), Some("build"));
        assert_eq!(last.sections.files[0].from_stage, Some(0));
        assert_eq!(
            last.sections.files[0].transfers,
            vec![FileTransfer {
                src: "/app".into(),
                dst: "/usr/local/bin/app".into()
            }]
        );
        assert_eq!(
            last.sections.files[1].transfers,
            vec![
                FileTransfer {
                    src: "my file.txt".into(),
                    dst: "/opt/".into()
                },
                FileTransfer {
                    src: "data/*.csv".into(),
                    dst: "data/*.csv".into()
                },
            ]
        );
        assert_eq!(
            last.sections.labels,
            vec![
                ("Author".to_owned(), "someone".to_owned()),
                ("Version".to_owned(), "v1.0 beta".to_owned()),
            ]
        );
        assert_eq!(last.sections.environment.body, "    export LANG=C");
    }

    #[test]
    fn test_header_keys_case_insensitive() {
        let recipe = parse("BOOTSTRAP: scratch\nsTaGe: one\n").unwrap();
        assert_eq!(recipe.stages[0].bootstrap().unwrap(), Bootstrap::Scratch);
        assert_eq!(recipe.stages[0].stage_name(), Some("one"));
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(parse(""), Err(DefinitionError::Empty));
        assert_eq!(parse("# only a comment\n\n"), Err(DefinitionError::Empty));
    }

    #[test]
    fn test_malformed_header() {
        assert_eq!(
            parse("Bootstrap: docker\nthis is not a header\n"),
            Err(DefinitionError::MalformedHeader {
                line: 2,
                text: "this is not a header".into()
            })
        );
    }

    #[test]
    fn test_missing_stage_name() {
        let text = "Bootstrap: scratch\n%post\ntrue\nBootstrap: scratch\n";
        assert_eq!(
            parse(text),
            Err(DefinitionError::MissingStageName { index: 1 })
        );
    }

    #[test]
    fn test_duplicate_stage() {
        let text = "Bootstrap: scratch\nStage: a\nBootstrap: scratch\nStage: a\n";
        assert_eq!(parse(text), Err(DefinitionError::DuplicateStage("a".into())));
    }

    #[test]
    fn test_files_from_unknown_or_later_stage() {
        let unknown = "Bootstrap: scratch\nStage: a\n%files from nowhere\n/x\n";
        assert_eq!(
            parse(unknown),
            Err(DefinitionError::UnknownStage("nowhere".into()))
        );

        let later = "Bootstrap: scratch\nStage: a\n%files from b\n/x\nBootstrap: scratch\nStage: b\n";
        assert!(matches!(
            parse(later),
            Err(DefinitionError::ForwardStageReference { .. })
        ));
    }

    #[test]
    fn test_bad_section_args() {
        assert!(matches!(
            parse("Bootstrap: scratch\n%files to somewhere\n/x\n"),
            Err(DefinitionError::BadSectionArgs { line: 2, .. })
        ));
        assert!(matches!(
            parse("Bootstrap: scratch\n%apprun\necho\n"),
            Err(DefinitionError::BadSectionArgs { .. })
        ));
    }

    #[test]
    fn test_files_too_many_fields() {
        assert_eq!(
            parse("Bootstrap: scratch\n%files\n  a b c\n"),
            Err(DefinitionError::MalformedFiles {
                line: 3,
                text: "a b c".into()
            })
        );
    }

    #[test]
    fn test_duplicate_script_sections_are_appended() {
        let recipe = parse("Bootstrap: scratch\n%post -c /bin/bash\necho 1\n%post\necho 2\n").unwrap();
        let post = &recipe.stages[0].sections.post;
        assert_eq!(post.args, "-c /bin/bash");
        assert_eq!(post.body, "echo 1\necho 2");
    }

    #[test]
    fn test_apps_and_custom_sections() {
        let text = "\
Bootstrap: scratch
%appinstall foo
    make install
%apprun foo
    exec foo
%applabels foo
    Maintainer me
%appfiles foo
    foo.conf
%weird
  kept as is
";
        let recipe = parse(text).unwrap();
        let sections = &recipe.stages[0].sections;
        let foo = &sections.apps["foo"];
        assert_eq!(foo.install.body, "    make install");
        assert_eq!(foo.run.body, "    exec foo");
        assert_eq!(foo.labels, vec![("Maintainer".into(), "me".into())]);
        assert_eq!(foo.files[0].dst, "foo.conf");
        assert_eq!(sections.custom["weird"], "  kept as is");
    }

    #[test]
    fn test_comments_kept_inside_scripts() {
        let recipe = parse("# top\nBootstrap: scratch\n# header comment\n%test\n# check\nls\n").unwrap();
        assert_eq!(recipe.stages[0].sections.test.body, "# check\nls");
    }

    #[test]
    fn test_split_fields() {
        assert_eq!(
            split_fields(r#"a\ b "c d" 'e*' # trailing"#).unwrap(),
            vec!["a b", "c d", "e*"]
        );
        assert_eq!(split_fields("x#y").unwrap(), vec!["x#y"]);
        assert!(split_fields("'open").is_none());
    }
}
