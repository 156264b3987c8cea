//! Output rendering.

use clap::ValueEnum;
use polari_core::{AccessQueryDict, PermissionQueryDict};

/// Output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Indented text
    Text,
    /// Pretty-printed JSON
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

fn pretty(json: &serde_json::Value) -> String {
    serde_json::to_string_pretty(json).unwrap_or_else(|_| json.to_string())
}

/// Render a tree dump produced by `ObjectTree::to_json`.
pub fn render_tree(tree: &serde_json::Value, format: OutputFormat) -> String {
    match format {
        OutputFormat::Json => pretty(tree),
        OutputFormat::Text => {
            let mut out = String::new();
            write_node(tree, 0, &mut out);
            out.trim_end().to_string()
        }
    }
}

fn write_node(node: &serde_json::Value, depth: usize, out: &mut String) {
    let class = node["class"].as_str().unwrap_or("?");
    let id = node["id"].as_str().unwrap_or("?");
    out.push_str(&"  ".repeat(depth));
    out.push_str(class);
    out.push(':');
    out.push_str(id);
    if let Some(target) = node["ref"].as_str() {
        out.push_str(" -> ");
        out.push_str(target);
    }
    out.push('\n');
    if let Some(children) = node["children"].as_array() {
        for child in children {
            write_node(child, depth + 1, out);
        }
    }
}

/// Render a principal's access and permission dicts.
pub fn render_access(
    access: &AccessQueryDict,
    permission: &PermissionQueryDict,
    format: OutputFormat,
) -> String {
    match format {
        OutputFormat::Json => pretty(&serde_json::json!({
            "access": access.to_json(),
            "permission": permission.to_json(),
        })),
        OutputFormat::Text => {
            if access.is_empty() {
                return "no access".to_string();
            }
            let mut lines = Vec::new();
            for (op, class, scope) in access.iter() {
                let fields = permission
                    .scope(op, class)
                    .map(|f| f.to_json().to_string())
                    .unwrap_or_else(|| "[]".to_string());
                lines.push(format!("{} {} instances={} fields={}", op, class, scope.to_json(), fields));
            }
            lines.join("\n")
        }
    }
}

/// Render a JSON result as-is.
pub fn render_json(json: &serde_json::Value) -> String {
    pretty(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polari_core::{FieldScope, InstanceScope, OpKind};

    #[test]
    fn test_render_tree_text() {
        let tree = serde_json::json!({
            "class": "polariManager", "id": "root",
            "children": [
                {"class": "Order", "id": "A1"},
                {"class": "Folder", "id": "f1", "children": [
                    {"class": "Order", "id": "A1", "ref": "/polariManager:root/Order:A1"}
                ]}
            ]
        });
        assert_eq!(
            render_tree(&tree, OutputFormat::Text),
            "polariManager:root\n  Order:A1\n  Folder:f1\n    Order:A1 -> /polariManager:root/Order:A1"
        );
    }

    #[test]
    fn test_render_access_text() {
        let mut access = AccessQueryDict::new();
        access.grant(OpKind::Read, "Order", InstanceScope::All);
        let mut permission = PermissionQueryDict::new();
        permission.grant(OpKind::Read, "Order", FieldScope::fields(["status"]));

        assert_eq!(
            render_access(&access, &permission, OutputFormat::Text),
            r#"R Order instances="*" fields=["status"]"#
        );
        assert_eq!(
            render_access(&AccessQueryDict::new(), &PermissionQueryDict::new(), OutputFormat::Text),
            "no access"
        );
    }
}
