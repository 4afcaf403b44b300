//! Per-task permission profiles, selected from the task's text.
//!
//! The profile decides which capabilities the Runner may advertise and
//! which extra prompt sections the worker includes (terminal-only note,
//! migration-safety section).

/// GUI-interaction keywords. A hit forces the terminal-only constraint:
/// workers run headless and must never attempt GUI automation.
pub const GUI_KEYWORDS: &[&str] = &[
    "gui",
    "screenshot",
    "browser",
    "click",
    "electron",
    "window",
    "dialog",
    "画面",
    "クリック",
];

/// Schema-change keywords. A hit adds the migration-safety prompt section.
const SCHEMA_KEYWORDS: &[&str] = &[
    "migration",
    "schema",
    "alter table",
    "create table",
    "マイグレーション",
];

/// Documentation-only keywords. A hit drops shell access.
const DOCS_KEYWORDS: &[&str] = &["documentation only", "docs only", "readme update"];

/// Capability profile for one task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionProfile {
    /// File read/write plus shell
    Full,
    /// Full, with the terminal-only environment constraint highlighted
    TerminalOnly,
    /// File read/write without shell
    DocsOnly,
    /// Full plus the migration-safety prompt section
    SchemaChange,
}

impl PermissionProfile {
    /// Concrete capability subset handed to the Runner.
    pub fn allowed_tools(&self) -> Vec<String> {
        let tools: &[&str] = match self {
            PermissionProfile::Full | PermissionProfile::TerminalOnly => {
                &["file_read", "file_write", "shell"]
            }
            PermissionProfile::DocsOnly => &["file_read", "file_write"],
            PermissionProfile::SchemaChange => &["file_read", "file_write", "shell", "db"],
        };
        tools.iter().map(|s| s.to_string()).collect()
    }

    /// Whether the worker prompt gets the migration-safety section.
    pub fn needs_migration_safety(&self) -> bool {
        matches!(self, PermissionProfile::SchemaChange)
    }
}

fn contains_any(text: &str, keywords: &[&str]) -> bool {
    keywords.iter().any(|kw| text.contains(kw))
}

/// Detected GUI keywords, for the planner's environment-constraint note.
pub fn detect_gui_keywords(title: &str, description: &str) -> Vec<String> {
    let text = format!("{} {}", title, description).to_lowercase();
    GUI_KEYWORDS
        .iter()
        .filter(|kw| text.contains(&kw.to_lowercase()))
        .map(|kw| kw.to_string())
        .collect()
}

/// Select a profile from the task's title and description.
pub fn resolve_profile(title: &str, description: &str) -> PermissionProfile {
    let text = format!("{} {}", title, description).to_lowercase();

    if contains_any(&text, SCHEMA_KEYWORDS) {
        return PermissionProfile::SchemaChange;
    }
    if !detect_gui_keywords(title, description).is_empty() {
        return PermissionProfile::TerminalOnly;
    }
    if contains_any(&text, DOCS_KEYWORDS) {
        return PermissionProfile::DocsOnly;
    }
    PermissionProfile::Full
}
