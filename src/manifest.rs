//! Loader for the flat manifest format produced by an external file-finding
//! scanner (§6.2): `d <dir>` lines set the current directory for subsequent
//! `f <name>` lines; a blank line resets to no current directory.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::graph::{Graph, NodeType};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("{path}:{line}: malformed manifest line: {text}")]
    Malformed { path: String, line: usize, text: String },
    #[error("reading manifest '{path}': {source}")]
    Io { path: String, source: std::io::Error },
    #[error("stat failed for '{path}'")]
    Stat { path: String },
}

/// Loads `manifest_path`, adding every listed file's node name into `src`
/// and every directory it names into `dirs`. Stamps are seeded from the
/// real filesystem (§4.3's src-node resolution), relative to `root`.
pub fn load_manifest(
    graph: &mut Graph,
    src: &mut Vec<String>,
    dirs: &mut Vec<String>,
    root: &Path,
    manifest_path: &Path,
) -> Result<(), ManifestError> {
    let text = std::fs::read_to_string(manifest_path).map_err(|e| ManifestError::Io {
        path: manifest_path.display().to_string(),
        source: e,
    })?;

    let mut current_dir: Option<String> = None;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            current_dir = None;
            continue;
        }

        let mut parts = line.splitn(2, ' ');
        let (op, rest) = match (parts.next(), parts.next()) {
            (Some(op), Some(rest)) if op == "d" || op == "f" => (op, rest),
            _ => {
                return Err(ManifestError::Malformed {
                    path: manifest_path.display().to_string(),
                    line: idx + 1,
                    text: line.to_string(),
                })
            }
        };

        if op == "d" {
            current_dir = Some(rest.to_string());
            dirs.push(rest.to_string());
            let abs = resolve(root, rest);
            stat_node(graph, rest, &abs)?;
            continue;
        }

        let name = match &current_dir {
            Some(d) if !d.is_empty() => format!("{d}/{rest}"),
            _ => rest.to_string(),
        };
        let abs = resolve(root, &name);
        stat_node(graph, &name, &abs)?;
        src.push(name);
    }

    Ok(())
}

fn resolve(root: &Path, rel: &str) -> PathBuf {
    if Path::new(rel).is_absolute() {
        PathBuf::from(rel)
    } else {
        root.join(rel)
    }
}

fn stat_node(graph: &mut Graph, name: &str, abs_path: &Path) -> Result<(), ManifestError> {
    let meta = std::fs::metadata(abs_path).map_err(|_| ManifestError::Stat { path: name.to_string() })?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let id = graph.add(name, NodeType::Src);
    let node = graph.node_mut(id);
    node.set_stamps(mtime);
    node.node_type = NodeType::Src;
    node.frozen = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn loads_files_under_the_most_recent_directory() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/a.c"), "").unwrap();
        std::fs::write(root.path().join("src/b.c"), "").unwrap();

        let manifest_path = root.path().join("manifest.txt");
        std::fs::write(&manifest_path, "d src\nf a.c\nf b.c\n").unwrap();

        let mut graph = Graph::new();
        let mut src = Vec::new();
        let mut dirs = Vec::new();
        load_manifest(&mut graph, &mut src, &mut dirs, root.path(), &manifest_path).unwrap();

        assert_eq!(src, vec!["src/a.c", "src/b.c"]);
        assert_eq!(dirs, vec!["src"]);
        assert!(graph.get("src/a.c").is_some());
    }

    #[test]
    fn blank_line_resets_current_directory() {
        let root = tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("src")).unwrap();
        std::fs::write(root.path().join("src/a.c"), "").unwrap();
        std::fs::write(root.path().join("top.c"), "").unwrap();

        let manifest_path = root.path().join("manifest.txt");
        std::fs::write(&manifest_path, "d src\nf a.c\n\nf top.c\n").unwrap();

        let mut graph = Graph::new();
        let mut src = Vec::new();
        let mut dirs = Vec::new();
        load_manifest(&mut graph, &mut src, &mut dirs, root.path(), &manifest_path).unwrap();

        assert_eq!(src, vec!["src/a.c", "top.c"]);
    }
}
