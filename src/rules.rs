//! Rule file loader: the stanza/command grammar of §4.6, macro and `for`
//! capture as raw (un-expanded) line lists per the design note in §9, and an
//! explicit location stack for error reporting.
//!
//! Loading is `async` (rather than a plain recursive-descent interpreter)
//! because `src`/`sub` on a generated output node must drive the queue to
//! completion before the rule file can be read (§4.6.3); the queue's own
//! execution loop is async, so the loader has to be too.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::env::{self, Environment, ExpandError, Scope};
use crate::graph::{Graph, GraphError, NodeType};
use crate::manifest::{self, ManifestError};
use crate::ordmap::OrderedStringMap;
use crate::span::{self, Span};

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("{0}")]
    Located(String),
    #[error(transparent)]
    Expand(#[from] ExpandError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("reading rule file '{path}': {source}")]
    Io { path: String, source: std::io::Error },
}

fn render_stack(frames: &[LocationFrame], message: &str) -> String {
    let mut lines: Vec<String> = frames
        .iter()
        .map(|f| match &f.what {
            Some(what) => format!("  {}:{}: {}", f.file, f.line, what),
            None => format!("  {}:{}", f.file, f.line),
        })
        .collect();
    lines.push(format!("error: {message}"));
    lines.join("\n")
}

#[derive(Debug, Clone)]
pub struct LocationFrame {
    pub file: String,
    pub line: usize,
    pub what: Option<String>,
}

#[derive(Debug, Default)]
struct Location {
    stack: Vec<LocationFrame>,
}

impl Location {
    fn push(&mut self, file: impl Into<String>, line: usize, what: Option<String>) {
        self.stack.push(LocationFrame { file: file.into(), line, what });
    }

    fn set_line(&mut self, line: usize) {
        if let Some(top) = self.stack.last_mut() {
            top.line = line;
        }
    }

    fn pop(&mut self) {
        self.stack.pop();
    }

    fn error(&self, message: impl Into<String>) -> RuleError {
        RuleError::Located(render_stack(&self.stack, &message.into()))
    }
}

/// Implemented by the scheduler so `src`/`sub` can build a generated rule or
/// manifest file before loading it (§4.6.3): "rule generation is a
/// first-class build step". `?Send` because the loader never spawns this
/// future off the current task -- it is driven to completion inline.
#[async_trait(?Send)]
pub trait GoalBuilder {
    /// Builds `goal` to completion. Returns `Ok(true)` on success, `Ok(false)`
    /// if the build ran but left the node failed.
    async fn build_goal(&mut self, graph: &mut Graph, goal: &str) -> Result<bool, RuleError>;

    /// Tells the builder the rule-file stamp accumulated so far (§4.4): the
    /// max `changed` stamp among the rule files the loader has read this run.
    /// A no-op for builders (like [`NullBuilder`]) that never plan a rebuild.
    fn set_stamp_rules(&mut self, _stamp_rules: i64) {}
}

/// A no-op builder for loading plain (non-generated) rule files in tests.
pub struct NullBuilder;

#[async_trait(?Send)]
impl GoalBuilder for NullBuilder {
    async fn build_goal(&mut self, _graph: &mut Graph, _goal: &str) -> Result<bool, RuleError> {
        Ok(true)
    }
}

pub struct Loader<'g, 'b> {
    graph: &'g mut Graph,
    env: Environment,
    templates: OrderedStringMap<Vec<String>>,
    srcdir: PathBuf,
    loc: Location,
    builder: &'b mut dyn GoalBuilder,

    out_set: bool,
    meta_set: bool,
    cmd_set: bool,

    /// Max `changed` stamp seen so far among the rule files loaded this run
    /// (§4.4, `rules.h:369-370`). A `dep`/`sub`-driven rebuild of a generated
    /// rule file raises this exactly like any other source's stamp does.
    stamp_rules: i64,
}

impl<'g, 'b> Loader<'g, 'b> {
    pub fn new(graph: &'g mut Graph, srcdir: PathBuf, builder: &'b mut dyn GoalBuilder) -> Self {
        Loader {
            graph,
            env: Environment::new(),
            templates: OrderedStringMap::new(),
            srcdir,
            loc: Location::default(),
            builder,
            out_set: false,
            meta_set: false,
            cmd_set: false,
            stamp_rules: 0,
        }
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The rule-file stamp accumulated so far; threaded into the final
    /// `Queue` so a command-hash mismatch can raise `stamp_want` by it
    /// (`queue.h:355-361`).
    pub fn stamp_rules(&self) -> i64 {
        self.stamp_rules
    }

    pub fn env_mut(&mut self) -> &mut Environment {
        &mut self.env
    }

    pub fn set_global(&mut self, name: &str, value: impl Into<String>) -> Result<(), RuleError> {
        self.env.set(Scope::Global, name)?;
        self.env.add(Scope::Global, name, value)?;
        Ok(())
    }

    fn reset_stanza_flags(&mut self) {
        self.out_set = false;
        self.meta_set = false;
        self.cmd_set = false;
    }

    fn stanza_clear(&mut self) {
        self.reset_stanza_flags();
        self.env.reset_local();
        let _ = self.env.set(Scope::Local, "dep");
    }

    fn stanza_end(&mut self) -> Result<(), RuleError> {
        if self.out_set || self.meta_set {
            if self.out_set && self.meta_set {
                return Err(self.loc.error("can't have both 'out' and 'meta' in the same stanza"));
            }

            let name = self
                .env
                .get(Scope::Local, "out")
                .and_then(|v| v.values().first())
                .cloned()
                .ok_or_else(|| self.loc.error("out must expand into exactly one item"))?;

            if let Some(existing) = self.graph.get(&name) {
                if self.graph.node(existing).frozen {
                    return Err(self.loc.error(format!("duplicate output: {name}")));
                }
            }

            let node_type = if self.meta_set { NodeType::Meta } else { NodeType::Out };
            let node = self.graph.add(&name, node_type);
            self.graph.node_mut(node).node_type = node_type;
            self.graph.node_mut(node).frozen = true;

            if self.cmd_set {
                let cmd = self
                    .env
                    .get(Scope::Local, "cmd")
                    .map(|v| v.values().to_vec())
                    .unwrap_or_default();
                let argv0 = cmd.first().cloned();
                self.graph.node_mut(node).cmd = cmd;
                if let Some(argv0) = argv0 {
                    self.graph.add_dep(node, &argv0, false);
                }
            }

            if let Some(deps) = self.env.get(Scope::Local, "dep") {
                for dep_name in deps.values().to_vec() {
                    self.graph
                        .add_declared_dep(node, &dep_name, false)
                        .map_err(|e| self.loc.error(e.to_string()))?;
                }
            }
        }

        self.stanza_clear();
        Ok(())
    }

    /// Loads `text` (the contents of `file_name`) as a rule file.
    pub async fn load_str(&mut self, text: &str, file_name: &str) -> Result<(), RuleError> {
        let file_node = self.graph.resolve_or_create_file(file_name);
        let changed = self.graph.node(file_node).stamp_changed;
        if changed > self.stamp_rules {
            self.stamp_rules = changed;
            self.builder.set_stamp_rules(self.stamp_rules);
        }

        self.loc.push(file_name, 0, None);
        self.stanza_clear();

        let lines: Vec<span::LineCursor<'_>> = span::lines(text).collect();
        let mut i = 0usize;
        while i < lines.len() {
            let line = lines[i].text;
            self.loc.set_line(lines[i].line_no);

            if line.starts_with('#') {
                i += 1;
                continue;
            }
            if line.trim().is_empty() {
                self.stanza_end()?;
                i += 1;
                continue;
            }

            let (cmd, header_rest) = span::split_first_word(line);
            if cmd == "def" || cmd == "for" {
                let start = i;
                i += 1;
                let mut body = Vec::new();
                while i < lines.len() && !lines[i].text.trim().is_empty() {
                    body.push(lines[i].text.to_string());
                    i += 1;
                }
                if cmd == "def" {
                    let name = span::words(header_rest).next().unwrap_or("").to_string();
                    if self.env.get(Scope::Global, &name).is_some() {
                        return Err(self.loc.error(format!("name '{name}' is already used for a variable")));
                    }
                    self.templates.insert_or_replace(&name, body);
                } else {
                    self.loc.set_line(start + 1);
                    self.execute_for(header_rest, &body, file_name, start + 1).await?;
                }
                continue;
            }

            self.statement(line).await?;
            i += 1;
        }

        self.stanza_end()?;
        self.loc.pop();
        Ok(())
    }

    async fn statement(&mut self, line: &str) -> Result<(), RuleError> {
        let (cmd, rest) = span::split_first_word(line);
        self.command(cmd, rest).await
    }

    async fn command(&mut self, cmd: &str, args: &str) -> Result<(), RuleError> {
        match cmd {
            "cmd" => {
                self.cmd_set = true;
                self.env.set(Scope::Local, "cmd")?;
                for word in span::words(args) {
                    env::expand(&mut self.env, Scope::Local, "cmd", word)?;
                }
                if self.env.get(Scope::Local, "cmd").unwrap().values().is_empty() {
                    return Err(self.loc.error("empty command"));
                }
                Ok(())
            }

            "src" => {
                let mut it = args.splitn(3, ' ');
                let src_name = it.next().unwrap_or("").trim();
                let dir_name = it.next().unwrap_or("").trim();
                let rest = it.next().unwrap_or("");

                if self.env.get(Scope::Global, src_name).is_none() {
                    self.env.set(Scope::Global, src_name)?;
                }
                if self.env.get(Scope::Global, dir_name).is_none() {
                    self.env.set(Scope::Global, dir_name)?;
                }

                self.env.set(Scope::Local, "$$manifest-path$$")?;
                for word in span::words(rest) {
                    env::expand(&mut self.env, Scope::Local, "$$manifest-path$$", word)?;
                }
                let paths = self.env.get(Scope::Local, "$$manifest-path$$").unwrap().values().to_vec();

                for path in paths {
                    let node = self.graph.resolve_or_create_file(&path);
                    self.build_if_output(&path).await?;

                    let mut src_values = self.env.get(Scope::Global, src_name).unwrap().values().to_vec();
                    let mut dir_values = self.env.get(Scope::Global, dir_name).unwrap().values().to_vec();
                    let root = self.dirfd_for(node).to_path_buf();
                    manifest::load_manifest(
                        self.graph,
                        &mut src_values,
                        &mut dir_values,
                        &root,
                        Path::new(&path),
                    )?;
                    self.env.set(Scope::Global, src_name)?;
                    for v in src_values {
                        self.env.add(Scope::Global, src_name, v)?;
                    }
                    self.env.set(Scope::Global, dir_name)?;
                    for v in dir_values {
                        self.env.add(Scope::Global, dir_name, v)?;
                    }
                }
                Ok(())
            }

            "out" | "meta" => {
                if cmd == "out" {
                    self.out_set = true;
                } else {
                    self.meta_set = true;
                }
                self.env.set(Scope::Local, "out")?;
                for word in span::words(args) {
                    env::expand(&mut self.env, Scope::Local, "out", word)?;
                }
                let values_len = self.env.get(Scope::Local, "out").unwrap().values().len();
                if values_len != 1 {
                    return Err(self.loc.error("out must expand into exactly one item"));
                }
                Ok(())
            }

            "dep" | "add" | "add=" => {
                let is_dep = cmd == "dep";
                let split = cmd != "add=";
                let (name, body) = if is_dep {
                    ("dep".to_string(), args)
                } else {
                    let (name, rest) = span::split_first_word(args);
                    (name.to_string(), rest)
                };

                let Some((scope, key)) = self.env.resolve(&name, true)? else {
                    return Err(self.loc.error(format!("cannot add to a non-existent variable {name}")));
                };
                let before_len = self.env.get(scope, &key).map(|v| v.values().len()).unwrap_or(0);

                if split {
                    for word in span::words(body) {
                        env::expand(&mut self.env, scope, &key, word)?;
                    }
                } else {
                    env::expand(&mut self.env, scope, &key, body)?;
                }

                if is_dep {
                    // Rewrite every newly-added value to its project-relative
                    // form first, so the existence check below and the node
                    // lookup `stanza_end` performs later agree on the same
                    // name (`rules.h:186-195`).
                    let srcdir_prefix = format!("{}/", self.srcdir.display());
                    let len = self.env.get(scope, &key).unwrap().values().len();
                    for idx in before_len..len {
                        let value = self.env.get(scope, &key).unwrap().values()[idx].clone();
                        if let Some(rest) = Span::new(&value).starts_with(&srcdir_prefix) {
                            self.env.replace_value(scope, &key, idx, rest.as_str().to_string())?;
                        }
                    }

                    let values = self.env.get(scope, &key).unwrap().values().to_vec();
                    for value in &values[before_len..] {
                        if self.graph.get(value).map(|id| self.graph.node(id).frozen) != Some(true) {
                            return Err(self.loc.error(format!("dep: node for '{value}' does not exist")));
                        }
                    }
                }
                Ok(())
            }

            "set" | "set=" | "let" | "let=" => {
                let global = cmd.starts_with("set");
                let split = !cmd.ends_with('=');
                let (name, body) = span::split_first_word(args);

                if self.templates.contains(name) {
                    return Err(self.loc.error(format!("name '{name}' is already used for a template")));
                }

                let scope = if global { Scope::Global } else { Scope::Local };
                self.env.set(scope, name)?;

                if split {
                    for word in span::words(body) {
                        env::expand(&mut self.env, scope, name, word)?;
                    }
                } else {
                    env::expand(&mut self.env, scope, name, body)?;
                }
                Ok(())
            }

            "use" => {
                let name = span::words(args).next().unwrap_or("");
                let body = self
                    .templates
                    .get(name)
                    .cloned()
                    .ok_or_else(|| self.loc.error(format!("undefined template {name}")))?;
                self.loc.push(format!("<macro {name}>"), 0, Some("in a macro defined here".to_string()));
                for (idx, line) in body.iter().enumerate() {
                    self.loc.set_line(idx + 1);
                    if line.trim().is_empty() {
                        continue;
                    }
                    // Box the recursion: `statement` is async and `use` can
                    // nest arbitrarily (macro calling macro), which would
                    // otherwise produce an infinitely-sized future type.
                    Box::pin(self.statement(line)).await?;
                }
                self.loc.pop();
                Ok(())
            }

            "sub" | "sub?" => {
                let ignore_missing = cmd == "sub?";
                self.env.set(Scope::Local, "$$sub-files$$")?;
                for word in span::words(args) {
                    env::expand(&mut self.env, Scope::Local, "$$sub-files$$", word)?;
                }
                let files = self.env.get(Scope::Local, "$$sub-files$$").unwrap().values().to_vec();

                for file in files {
                    if ignore_missing && !Path::new(&file).exists() {
                        continue;
                    }
                    self.loc.push(&file, 0, Some("included from here".to_string()));
                    self.graph.resolve_or_create_file(&file);
                    self.build_if_output(&file).await?;
                    let text = std::fs::read_to_string(&file).map_err(|e| RuleError::Io {
                        path: file.clone(),
                        source: e,
                    })?;
                    Box::pin(self.load_str(&text, &file)).await?;
                    self.loc.pop();
                }
                Ok(())
            }

            other => Err(self.loc.error(format!("unknown command '{other}'"))),
        }
    }

    async fn execute_for(&mut self, header: &str, body: &[String], file: &str, start_line: usize) -> Result<(), RuleError> {
        let mut words = span::words(header);
        let name = words.next().unwrap_or("").to_string();
        self.env.set(Scope::Local, "$$for-iter$$")?;
        for word in words {
            env::expand(&mut self.env, Scope::Local, "$$for-iter$$", word)?;
        }
        let values = self.env.get(Scope::Local, "$$for-iter$$").unwrap().values().to_vec();

        let saved_local = std::mem::take(&mut self.env.local);

        for value in values {
            self.loc.push(file, start_line, Some(format!("while evaluating for loop with {name} = {value}")));
            self.reset_stanza_flags();
            self.env.local = clone_scope(&saved_local);
            let _ = self.env.set(Scope::Local, "dep");
            self.env.set(Scope::Local, &name)?;
            self.env.add(Scope::Local, &name, value)?;

            for (idx, line) in body.iter().enumerate() {
                self.loc.set_line(start_line + idx + 1);
                if line.trim().is_empty() {
                    continue;
                }
                self.statement(line).await?;
            }
            self.stanza_end()?;
            self.loc.pop();
        }

        self.env.local = saved_local;
        Ok(())
    }

    fn dirfd_for(&self, node: crate::graph::NodeId) -> &Path {
        if self.graph.node(node).node_type == NodeType::Out {
            Path::new(".")
        } else {
            &self.srcdir
        }
    }

    async fn build_if_output(&mut self, name: &str) -> Result<(), RuleError> {
        let Some(id) = self.graph.get(name) else { return Ok(()) };
        if self.graph.node(id).node_type != NodeType::Out {
            return Ok(());
        }
        let ok = self.builder.build_goal(self.graph, name).await?;
        if !ok {
            return Err(self.loc.error(format!("error building {name}")));
        }
        Ok(())
    }
}

fn clone_scope(map: &OrderedStringMap<env::Variable>) -> OrderedStringMap<env::Variable> {
    let mut out = OrderedStringMap::new();
    for (k, v) in map.iter() {
        out.insert(k, v.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loader<'g, 'b>(graph: &'g mut Graph, builder: &'b mut dyn GoalBuilder) -> Loader<'g, 'b> {
        Loader::new(graph, PathBuf::from("."), builder)
    }

    #[tokio::test]
    async fn plain_build_scenario_s1() {
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = loader(&mut graph, &mut builder);
        l.graph.add("y", NodeType::Src);
        l.graph.node_mut(l.graph.get("y").unwrap()).frozen = true;

        let text = "out x\ncmd /bin/echo hello\ndep y\n";
        l.load_str(text, "build.gib").await.unwrap();

        let x = graph.get("x").unwrap();
        assert_eq!(graph.node(x).cmd, vec!["/bin/echo", "hello"]);
        assert!(graph.node(x).deps.iter().any(|d| d.name == "y"));
        assert!(graph.node(x).deps.iter().any(|d| d.name == "/bin/echo"));
    }

    #[tokio::test]
    async fn out_and_meta_in_same_stanza_is_an_error() {
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = loader(&mut graph, &mut builder);
        let text = "out x\nmeta y\n";
        assert!(l.load_str(text, "build.gib").await.is_err());
    }

    #[tokio::test]
    async fn for_loop_pattern_expansion_scenario_s6() {
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = loader(&mut graph, &mut builder);
        for f in ["a.c", "b.c", "c.c"] {
            let id = l.graph.add(f, NodeType::Src);
            l.graph.node_mut(id).frozen = true;
        }
        l.set_global("files", "a.c").unwrap();
        l.env_mut().add(Scope::Global, "files", "b.c").unwrap();
        l.env_mut().add(Scope::Global, "files", "c.c").unwrap();

        let text = "for s $(files:%.c:%)\n  dep $(s).c\n  out $(s).o\n  cmd /bin/cc -c $(s).c\n";
        l.load_str(text, "build.gib").await.unwrap();

        assert!(graph.get("a.o").is_some());
        assert!(graph.get("b.o").is_some());
        assert!(graph.get("c.o").is_some());
    }

    #[tokio::test]
    async fn dep_referencing_unknown_node_errors() {
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = loader(&mut graph, &mut builder);
        let text = "out x\ncmd /bin/echo hi\ndep nonexistent\n";
        assert!(l.load_str(text, "build.gib").await.is_err());
    }

    #[tokio::test]
    async fn macro_used_inside_for_body_reports_full_location_stack() {
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = loader(&mut graph, &mut builder);
        let text = "def mymacro\n  dep nonexistent\n\nfor s a\n  use mymacro\n";
        let err = l.load_str(text, "build.gib").await.unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("for loop"));
        assert!(msg.contains("macro"));
    }

    /// §4.4: `stamp_rules` is the max `changed` stamp among the rule files
    /// the loader actually read, derived from the rule file's own mtime --
    /// not a fixed constant -- so a newer rule file raises it further.
    #[tokio::test]
    async fn load_str_tracks_stamp_rules_from_the_rule_files_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.gib");
        std::fs::write(&path, "out x\ncmd /bin/echo hi\n").unwrap();
        filetime::set_file_mtime(&path, filetime::FileTime::from_unix_time(12_345, 0)).unwrap();

        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = Loader::new(&mut graph, dir.path().to_path_buf(), &mut builder);
        let text = std::fs::read_to_string(&path).unwrap();
        l.load_str(&text, path.to_str().unwrap()).await.unwrap();

        assert_eq!(l.stamp_rules(), 12_345);
    }

    /// A `dep` value carrying the `$srcdir/` prefix is stored stripped, so
    /// `stanza_end`'s node lookup and this command's own existence check
    /// agree on the same name (otherwise the former raises a spurious
    /// `UndefinedDependency`).
    #[tokio::test]
    async fn dep_strips_srcdir_prefix_before_storing_the_value() {
        let dir = tempfile::tempdir().unwrap();
        let mut graph = Graph::new();
        let mut builder = NullBuilder;
        let mut l = Loader::new(&mut graph, dir.path().to_path_buf(), &mut builder);
        let y = l.graph.add("y.h", NodeType::Src);
        l.graph.node_mut(y).frozen = true;

        let text = format!("out x\ncmd /bin/echo hi\ndep {}/y.h\n", dir.path().display());
        l.load_str(&text, "build.gib").await.unwrap();

        let x = graph.get("x").unwrap();
        assert!(graph.node(x).deps.iter().any(|d| d.name == "y.h"));
    }
}
