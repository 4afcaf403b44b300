//! Embedded prompt templates, rendered with typed contexts.

use std::sync::LazyLock;

use eyre::{Context, Result};
use handlebars::Handlebars;
use serde::Serialize;

static REGISTRY: LazyLock<Handlebars<'static>> = LazyLock::new(|| {
    let mut hb = Handlebars::new();
    hb.register_escape_fn(handlebars::no_escape);
    for (name, template) in [
        ("worker", include_str!("prompts/worker.hbs")),
        ("fix", include_str!("prompts/fix.hbs")),
        ("review", include_str!("prompts/review.hbs")),
        ("plan", include_str!("prompts/plan.hbs")),
        ("redesign", include_str!("prompts/redesign.hbs")),
    ] {
        hb.register_template_string(name, template)
            .unwrap_or_else(|e| panic!("embedded template {} is invalid: {}", name, e));
    }
    hb
});

/// Render one of the embedded templates.
pub fn render<T: Serialize>(name: &str, context: &T) -> Result<String> {
    REGISTRY
        .render(name, context)
        .context(format!("Failed to render template '{}'", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_worker_template_renders() {
        let prompt = render(
            "worker",
            &json!({
                "task_id": "TASK_001",
                "order_id": "ORDER_001",
                "project_id": "demo",
                "title": "Add pagination",
                "priority": "P1",
                "description": "limit/offset in list API",
                "target_files": ["src/api.py"],
                "rework_history": [],
                "allowed_tools": "file_read, file_write, shell",
                "project_path": "/tmp/demo",
                "migration_safety": false,
                "known_bugs": [],
            }),
        )
        .unwrap();
        assert!(prompt.contains("TASK_001"));
        assert!(prompt.contains("src/api.py"));
        assert!(prompt.contains("headless terminal"));
        assert!(!prompt.contains("Migration safety"));
    }

    #[test]
    fn test_worker_template_conditional_sections() {
        let prompt = render(
            "worker",
            &json!({
                "task_id": "TASK_002",
                "order_id": "ORDER_001",
                "project_id": "demo",
                "title": "Schema change",
                "priority": "P0",
                "allowed_tools": "file_read, file_write, shell, db",
                "project_path": "/tmp/demo",
                "migration_safety": true,
                "rework_history": [
                    {"timestamp": "2025-01-01T00:00:00Z", "comment": "tests missing"}
                ],
                "known_bugs": [
                    {"title": "Off-by-one", "severity": "medium", "solution": "inclusive bound"}
                ],
            }),
        )
        .unwrap();
        assert!(prompt.contains("Migration safety"));
        assert!(prompt.contains("tests missing"));
        assert!(prompt.contains("Off-by-one"));
    }

    #[test]
    fn test_review_template_embeds_criteria_and_report() {
        let prompt = render(
            "review",
            &json!({
                "task_id": "TASK_001",
                "order_id": "ORDER_001",
                "project_id": "demo",
                "title": "Add pagination",
                "priority": "P1",
                "reject_count": 2,
                "criteria": "RELAXED CRITERIA TEXT",
                "report": "the report body",
            }),
        )
        .unwrap();
        assert!(prompt.contains("RELAXED CRITERIA TEXT"));
        assert!(prompt.contains("the report body"));
        assert!(prompt.contains("\"verdict\""));
    }

    #[test]
    fn test_no_html_escaping() {
        let prompt = render(
            "review",
            &json!({
                "task_id": "TASK_001",
                "order_id": "ORDER_001",
                "project_id": "demo",
                "title": "a < b && c > d",
                "priority": "P1",
                "reject_count": 0,
                "criteria": "",
                "report": "",
            }),
        )
        .unwrap();
        assert!(prompt.contains("a < b && c > d"));
    }
}
