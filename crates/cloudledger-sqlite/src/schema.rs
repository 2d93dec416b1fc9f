//! Table layout derived from resource descriptors
//!
//! Identifiers come from validated descriptors (`[a-z][a-z0-9_]*`) and are
//! quoted anyway.

use cloudledger::{ChildSpec, FieldKind, ResourceDescriptor};

pub(crate) fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

pub(crate) fn column_type(kind: FieldKind) -> &'static str {
    match kind {
        FieldKind::Text => "TEXT",
        FieldKind::Integer | FieldKind::Boolean => "INTEGER",
        FieldKind::Real => "REAL",
    }
}

/// Scalar then opaque columns of the live and history tables
pub(crate) fn field_columns(desc: &ResourceDescriptor) -> Vec<(String, &'static str)> {
    desc.scalar_fields
        .iter()
        .map(|f| (f.name.clone(), column_type(f.kind)))
        .chain(desc.opaque_fields.iter().map(|o| (o.name.clone(), "BLOB")))
        .collect()
}

pub(crate) fn child_columns(child: &ChildSpec) -> Vec<(String, &'static str)> {
    child
        .fields
        .iter()
        .map(|f| (f.name.clone(), column_type(f.kind)))
        .collect()
}

fn column_defs(columns: &[(String, &'static str)]) -> String {
    columns
        .iter()
        .map(|(name, ty)| format!(",\n  {} {}", quote(name), ty))
        .collect()
}

/// Every `CREATE ... IF NOT EXISTS` statement a descriptor needs
pub fn create_statements(desc: &ResourceDescriptor) -> Vec<String> {
    let live = desc.live_table();
    let history = desc.history_table();
    let fields = column_defs(&field_columns(desc));

    let mut statements = vec![
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  entity_id TEXT PRIMARY KEY,\n  scope_id TEXT NOT NULL,\n  collected_at INTEGER NOT NULL{}\n)",
            quote(&live),
            fields
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (scope_id, collected_at)",
            quote(&format!("{}_scope_idx", live)),
            quote(&live)
        ),
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  history_id INTEGER PRIMARY KEY AUTOINCREMENT,\n  entity_id TEXT NOT NULL,\n  valid_from INTEGER NOT NULL,\n  valid_to INTEGER,\n  scope_id TEXT NOT NULL,\n  collected_at INTEGER NOT NULL{}\n)",
            quote(&history),
            fields
        ),
        // At most one open record per entity
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON {} (entity_id) WHERE valid_to IS NULL",
            quote(&format!("{}_open_idx", history)),
            quote(&history)
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (entity_id, valid_from)",
            quote(&format!("{}_entity_idx", history)),
            quote(&history)
        ),
    ];

    for child in &desc.children {
        let live_child = desc.live_child_table(&child.name);
        let history_child = desc.history_child_table(&child.name);
        let fields = column_defs(&child_columns(child));

        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  id INTEGER PRIMARY KEY AUTOINCREMENT,\n  entity_id TEXT NOT NULL REFERENCES {} (entity_id),\n  position INTEGER NOT NULL,\n  row_key TEXT{}\n)",
            quote(&live_child),
            quote(&live),
            fields
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (entity_id, position)",
            quote(&format!("{}_entity_idx", live_child)),
            quote(&live_child)
        ));
        statements.push(format!(
            "CREATE TABLE IF NOT EXISTS {} (\n  id INTEGER PRIMARY KEY AUTOINCREMENT,\n  parent_history_id INTEGER NOT NULL REFERENCES {} (history_id),\n  entity_id TEXT NOT NULL,\n  position INTEGER NOT NULL,\n  row_key TEXT,\n  valid_from INTEGER NOT NULL,\n  valid_to INTEGER{}\n)",
            quote(&history_child),
            quote(&history),
            fields
        ));
        statements.push(format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (parent_history_id, valid_to)",
            quote(&format!("{}_parent_idx", history_child)),
            quote(&history_child)
        ));
    }

    statements
}

/// Tables with the descriptor columns they must carry, for adding fields to
/// existing databases
pub(crate) fn expected_columns(desc: &ResourceDescriptor) -> Vec<(String, Vec<(String, &'static str)>)> {
    let fields = field_columns(desc);
    let mut tables = vec![
        (desc.live_table(), fields.clone()),
        (desc.history_table(), fields),
    ];
    for child in &desc.children {
        let columns = child_columns(child);
        tables.push((desc.live_child_table(&child.name), columns.clone()));
        tables.push((desc.history_child_table(&child.name), columns));
    }
    tables
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudledger::builtin;

    #[test]
    fn test_statements_cover_every_table() {
        let desc = builtin::instance();
        let statements = create_statements(&desc);
        let tables = statements
            .iter()
            .filter(|s| s.starts_with("CREATE TABLE"))
            .count();
        assert_eq!(tables, 2 + 2 * desc.children.len());

        let live = &statements[0];
        assert!(live.contains("\"live_instance\""));
        assert!(live.contains("\"deletion_protection\" INTEGER"));
        assert!(live.contains("\"metadata\" BLOB"));

        assert!(
            statements
                .iter()
                .any(|s| s.contains("UNIQUE INDEX") && s.contains("WHERE valid_to IS NULL"))
        );
    }

    #[test]
    fn test_expected_columns() {
        let desc = builtin::disk();
        let tables = expected_columns(&desc);
        let users = tables
            .iter()
            .find(|(t, _)| t == "history_disk_users")
            .unwrap();
        assert_eq!(users.1, vec![("user".to_string(), "TEXT")]);
    }
}
