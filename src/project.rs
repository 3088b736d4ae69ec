//! Coarse project classification used to route commands to capability providers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    Rust,
    Go,
    TypeScript,
    Node,
    Python,
    Java,
    Ruby,
    Php,
    DotNet,
    Cpp,
    Unknown,
}

impl ProjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectKind::Rust => "rust",
            ProjectKind::Go => "go",
            ProjectKind::TypeScript => "typescript",
            ProjectKind::Node => "node",
            ProjectKind::Python => "python",
            ProjectKind::Java => "java",
            ProjectKind::Ruby => "ruby",
            ProjectKind::Php => "php",
            ProjectKind::DotNet => "dotnet",
            ProjectKind::Cpp => "cpp",
            ProjectKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classification attached to a session at creation. Never changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectContext {
    pub kind: ProjectKind,
    pub root: PathBuf,
}

impl ProjectContext {
    pub fn unknown(root: impl Into<PathBuf>) -> Self {
        Self {
            kind: ProjectKind::Unknown,
            root: root.into(),
        }
    }

    pub fn tag(&self) -> &'static str {
        self.kind.as_str()
    }
}

enum Marker {
    File(&'static str),
    Extension(&'static str),
}

/// Priority order: the first kind with a matching marker wins at a given depth.
const MARKERS: &[(ProjectKind, &[Marker])] = &[
    (ProjectKind::Rust, &[Marker::File("Cargo.toml")]),
    (ProjectKind::Go, &[Marker::File("go.mod")]),
    (ProjectKind::TypeScript, &[Marker::File("tsconfig.json")]),
    (ProjectKind::Node, &[Marker::File("package.json")]),
    (
        ProjectKind::Python,
        &[
            Marker::File("pyproject.toml"),
            Marker::File("setup.py"),
            Marker::File("requirements.txt"),
            Marker::File("Pipfile"),
        ],
    ),
    (
        ProjectKind::Java,
        &[
            Marker::File("pom.xml"),
            Marker::File("build.gradle"),
            Marker::File("build.gradle.kts"),
        ],
    ),
    (ProjectKind::Ruby, &[Marker::File("Gemfile")]),
    (ProjectKind::Php, &[Marker::File("composer.json")]),
    (ProjectKind::DotNet, &[Marker::Extension("csproj"), Marker::Extension("sln")]),
    (ProjectKind::Cpp, &[Marker::File("CMakeLists.txt")]),
];

const SKIPPED_DIRS: &[&str] = &["node_modules", "target", "vendor", "dist", "build", "__pycache__"];

/// Bounded, read-only filesystem inspection.
#[derive(Debug, Clone)]
pub struct ProjectContextProbe {
    pub max_depth: usize,
    pub max_entries: usize,
    pub deadline: Duration,
}

impl Default for ProjectContextProbe {
    fn default() -> Self {
        Self {
            max_depth: 2,
            max_entries: 2000,
            deadline: Duration::from_millis(100),
        }
    }
}

impl ProjectContextProbe {
    /// Classifies `directory`. Returns a context with [`ProjectKind::Unknown`] when no
    /// marker is found within the traversal bounds. Every directory at one depth is
    /// read before deciding, so the shallowest depth with any marker wins and the
    /// marker priority breaks ties within it.
    #[instrument(skip(self), fields(directory = %directory.display()))]
    pub fn probe(&self, directory: &Path) -> ProjectContext {
        let started = Instant::now();
        let mut visited = 0usize;
        let mut level = vec![directory.to_path_buf()];
        let mut exhausted = false;

        for depth in 0..=self.max_depth {
            let mut best: Option<usize> = None;
            let mut next_level = Vec::new();

            for dir in &level {
                if started.elapsed() >= self.deadline {
                    debug!(visited, "Probe deadline reached");
                    exhausted = true;
                    break;
                }
                let Ok(entries) = std::fs::read_dir(dir) else {
                    continue;
                };

                let mut file_names = Vec::new();
                for entry in entries.flatten() {
                    visited += 1;
                    if visited > self.max_entries {
                        debug!(visited, "Probe entry budget exhausted");
                        exhausted = true;
                        break;
                    }
                    let name = entry.file_name().to_string_lossy().into_owned();
                    match entry.file_type() {
                        Ok(ft) if ft.is_dir() => {
                            if !name.starts_with('.') && !SKIPPED_DIRS.contains(&name.as_str()) {
                                next_level.push(entry.path());
                            }
                        }
                        Ok(_) => file_names.push(name),
                        Err(_) => {}
                    }
                }

                if let Some(rank) = marker_rank(&file_names) {
                    best = Some(best.map_or(rank, |b| b.min(rank)));
                }
                if exhausted {
                    break;
                }
            }

            if let Some(rank) = best {
                let kind = MARKERS[rank].0;
                debug!(%kind, depth, visited, "Project marker matched");
                return ProjectContext {
                    kind,
                    root: directory.to_path_buf(),
                };
            }
            if exhausted || next_level.is_empty() {
                break;
            }
            next_level.sort();
            level = next_level;
        }

        ProjectContext::unknown(directory)
    }
}

/// Index into [`MARKERS`] of the highest-priority kind present; lower is stronger.
fn marker_rank(file_names: &[String]) -> Option<usize> {
    MARKERS.iter().position(|(_, markers)| {
        markers.iter().any(|marker| match marker {
            Marker::File(name) => file_names.iter().any(|f| f == name),
            Marker::Extension(ext) => file_names
                .iter()
                .any(|f| Path::new(f).extension().map_or(false, |e| e == *ext)),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, "").unwrap();
    }

    #[test]
    fn empty_directory_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ProjectContextProbe::default().probe(dir.path());
        assert_eq!(ctx.kind, ProjectKind::Unknown);
        assert_eq!(ctx.root, dir.path());
    }

    #[test]
    fn priority_order_at_same_depth() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("package.json"));
        touch(&dir.path().join("tsconfig.json"));
        touch(&dir.path().join("Cargo.toml"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::Rust);
    }

    #[test]
    fn typescript_beats_node() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("package.json"));
        touch(&dir.path().join("tsconfig.json"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::TypeScript);
    }

    #[test]
    fn shallow_marker_beats_deeper_higher_priority() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("requirements.txt"));
        touch(&dir.path().join("tools").join("Cargo.toml"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::Python);
    }

    #[test]
    fn sibling_directories_are_ranked_together() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a_web").join("package.json"));
        touch(&dir.path().join("b_core").join("Cargo.toml"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::Rust);
    }

    #[test]
    fn nested_marker_within_depth() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("service").join("go.mod"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::Go);
    }

    #[test]
    fn depth_bound_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("a").join("b").join("c").join("Cargo.toml"));
        let probe = ProjectContextProbe {
            max_depth: 2,
            ..Default::default()
        };
        assert_eq!(probe.probe(dir.path()).kind, ProjectKind::Unknown);
    }

    #[test]
    fn extension_markers_and_skipped_dirs() {
        let dir = tempfile::tempdir().unwrap();
        touch(&dir.path().join("node_modules").join("package.json"));
        touch(&dir.path().join("App.csproj"));
        assert_eq!(ProjectContextProbe::default().probe(dir.path()).kind, ProjectKind::DotNet);
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&ProjectKind::TypeScript).unwrap(), "\"typescript\"");
        assert_eq!(ProjectKind::DotNet.to_string(), "dotnet");
    }
}
