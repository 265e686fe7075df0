//! Planned verification steps (todos).
//!
//! `mender plan` asks the reasoning capability to break a test into ordered
//! steps and persists them as `todo_{id}.md`, one line per step:
//!
//! ```text
//! [pending] [1] (ui) Open the login page
//! [in-progress] [2] (api) Check the session endpoint
//! ```
//!
//! During healing the first unfinished todo is attached to patch requests.

use crate::error::{HealError, Result};
use crate::parse::extract_json_payload_where;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Kind of verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TodoKind {
    /// Browser interaction
    Ui,
    /// Request or backend check
    Api,
}

impl std::fmt::Display for TodoKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ui => write!(f, "ui"),
            Self::Api => write!(f, "api"),
        }
    }
}

impl TodoKind {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "ui" => Some(Self::Ui),
            "api" => Some(Self::Api),
            _ => None,
        }
    }
}

/// Status of a todo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Done,
    Failed,
}

impl std::fmt::Display for TodoStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InProgress => write!(f, "in-progress"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl TodoStatus {
    /// Parse a status, accepting `_`, `-` or space separators.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['_', ' '], "-").as_str() {
            "pending" => Some(Self::Pending),
            "in-progress" => Some(Self::InProgress),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// True for statuses that still need work.
    #[must_use]
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }
}

/// One unit of verification work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: u32,
    pub kind: TodoKind,
    pub description: String,
    pub status: TodoStatus,
}

impl Todo {
    /// Create a pending todo.
    pub fn new(id: u32, kind: TodoKind, description: impl Into<String>) -> Self {
        Self {
            id,
            kind,
            description: description.into(),
            status: TodoStatus::Pending,
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: TodoStatus) -> Self {
        self.status = status;
        self
    }

    /// Render as one todo-file line.
    #[must_use]
    pub fn to_line(&self) -> String {
        format!(
            "[{}] [{}] ({}) {}",
            self.status, self.id, self.kind, self.description
        )
    }

    /// Parse one todo-file line.
    #[must_use]
    pub fn from_line(line: &str) -> Option<Self> {
        static RE: OnceLock<Option<Regex>> = OnceLock::new();
        let re = RE
            .get_or_init(|| Regex::new(r"^\[([A-Za-z_ \-]+)\]\s+\[(\d+)\]\s+\((\w+)\)\s*(.*)$").ok())
            .as_ref()?;

        let caps = re.captures(line.trim())?;
        Some(Self {
            status: TodoStatus::parse(caps.get(1)?.as_str())?,
            id: caps.get(2)?.as_str().parse().ok()?,
            kind: TodoKind::parse(caps.get(3)?.as_str())?,
            description: caps.get(4)?.as_str().trim().to_string(),
        })
    }
}

/// An ordered, persisted list of todos for one test.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TodoList {
    /// Identifier used in the file name
    pub id: String,
    pub todos: Vec<Todo>,
    /// Other scripts the planner reported the test depends on
    pub related_scripts: Vec<PathBuf>,
}

/// Wire shape of a planning response.
#[derive(Debug, Deserialize)]
struct PlanResponse {
    #[serde(default)]
    todos: Vec<PlanTodo>,
    #[serde(default, alias = "related_scripts")]
    related_script_pathes: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct PlanTodo {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default, rename = "type", alias = "kind")]
    kind: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status: Option<String>,
}

impl TodoList {
    /// Create an empty list.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// File name for a list id.
    #[must_use]
    pub fn file_name(id: &str) -> String {
        format!("todo_{id}.md")
    }

    /// Path of this list inside `dir`.
    #[must_use]
    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(Self::file_name(&self.id))
    }

    /// Parse a planning response.
    ///
    /// Missing ids are numbered by position, unknown kinds default to `ui`
    /// and unknown statuses to `pending`.
    pub fn from_plan_response(response: &str, id: impl Into<String>) -> Result<Self> {
        let plan: PlanResponse =
            extract_json_payload_where(response, |v| v.get("todos").is_some()).ok_or_else(|| {
                HealError::reasoning("planning response contains no todo payload")
            })?;

        let todos: Vec<Todo> = plan
            .todos
            .into_iter()
            .filter(|t| !t.description.trim().is_empty())
            .enumerate()
            .map(|(index, raw)| {
                let kind = raw.kind.as_deref().and_then(TodoKind::parse).unwrap_or_else(|| {
                    warn!("Unrecognised todo type {:?}, using ui", raw.kind);
                    TodoKind::Ui
                });
                Todo {
                    id: raw.id.unwrap_or(index as u32 + 1),
                    kind,
                    description: raw.description.trim().to_string(),
                    status: raw
                        .status
                        .as_deref()
                        .and_then(TodoStatus::parse)
                        .unwrap_or_default(),
                }
            })
            .collect();

        if todos.is_empty() {
            return Err(HealError::reasoning("planning response contains no todos"));
        }

        Ok(Self {
            id: id.into(),
            todos,
            related_scripts: plan.related_script_pathes,
        })
    }

    /// Load a list from a todo file. The id is taken from the file name.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(HealError::MissingFile {
                path: path.to_path_buf(),
            });
        }
        let content = fs::read_to_string(path)?;

        let mut todos = Vec::new();
        for (number, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let todo = Todo::from_line(line).ok_or_else(|| {
                HealError::config_with_path(
                    format!("line {}: malformed todo: {line}", number + 1),
                    path.to_path_buf(),
                )
            })?;
            todos.push(todo);
        }

        let id = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(|s| s.strip_prefix("todo_").unwrap_or(s).to_string())
            .unwrap_or_default();

        Ok(Self {
            id,
            todos,
            related_scripts: Vec::new(),
        })
    }

    /// Save the list into `dir` atomically. Returns the file path.
    pub fn save(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let path = self.path_in(dir);
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save the list to an explicit path atomically.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let mut content = String::new();
        for todo in &self.todos {
            content.push_str(&todo.to_line());
            content.push('\n');
        }

        let tmp_path = path.with_extension("md.tmp");
        let write = || -> Result<()> {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(content.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp_path, path)?;
            Ok(())
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }
        debug!("Saved {} todos to {}", self.todos.len(), path.display());
        Ok(())
    }

    /// Mark the first open todo in progress and return it.
    ///
    /// A todo already in progress is returned as-is.
    pub fn start_next(&mut self) -> Option<Todo> {
        let todo = self.todos.iter_mut().find(|t| t.status.is_open())?;
        todo.status = TodoStatus::InProgress;
        Some(todo.clone())
    }

    /// Record a session outcome: everything is done when healed, otherwise
    /// the step in progress failed.
    pub fn finish(&mut self, healed: bool) {
        for todo in &mut self.todos {
            if healed {
                todo.status = TodoStatus::Done;
            } else if todo.status == TodoStatus::InProgress {
                todo.status = TodoStatus::Failed;
            }
        }
    }

    /// Count of todos with the given status.
    #[must_use]
    pub fn count(&self, status: TodoStatus) -> usize {
        self.todos.iter().filter(|t| t.status == status).count()
    }
}
