//! Jira issue and changelog mapping.

use super::{raw_json, FieldReader, Normalized};
use crate::models::{ChangelogRow, EntityType, IssueRow};
use serde_json::Value;

/// Map one issue and its change history.
///
/// Each history entry is flattened into one changelog row per changed
/// field, carrying the issue key and the field name. Rows keep the whole
/// history entry as their raw payload.
pub fn normalize_issue(issue: &Value, histories: &[Value]) -> Normalized {
    let mut out = Normalized::default();
    let mut reader = FieldReader::new(issue, EntityType::Issue, &mut out.warnings);

    let Some(key) = reader.str("key") else {
        reader.warn("key", "missing natural key, record skipped");
        return out;
    };
    reader.identify(key.as_str());

    out.rows.issues.push(IssueRow {
        id: reader.id("id"),
        summary: reader.str("fields.summary"),
        status: reader.str("fields.status.name"),
        issue_type: reader.str("fields.issuetype.name"),
        assignee: reader.str("fields.assignee.displayName"),
        created: reader.timestamp("fields.created"),
        updated: reader.timestamp("fields.updated"),
        fields: reader.json("fields"),
        raw: raw_json(issue),
        key: key.clone(),
    });

    for history in histories {
        normalize_history(&key, history, &mut out);
    }

    out
}

fn normalize_history(issue_key: &str, history: &Value, out: &mut Normalized) {
    let mut reader = FieldReader::new(history, EntityType::ChangelogEntry, &mut out.warnings);

    let Some(id) = reader.id("id") else {
        reader.warn("id", format!("history entry of {} without id skipped", issue_key));
        return;
    };
    reader.identify(format!("{}/{}", issue_key, id));

    let created = reader.timestamp("created");
    let author_account_id = reader.str("author.accountId");
    let author_display_name = reader.str("author.displayName");
    let raw = raw_json(history);

    let items: &[Value] = match history.get("items") {
        Some(Value::Array(items)) => items.as_slice(),
        None | Some(Value::Null) => &[],
        Some(_) => {
            reader.warn("items", "expected an array");
            &[]
        }
    };

    for (index, item) in items.iter().enumerate() {
        let mut reader = FieldReader::new(item, EntityType::ChangelogEntry, &mut out.warnings);
        reader.identify(format!("{}/{}", issue_key, id));

        let Some(field) = reader.str("field") else {
            reader.warn("field", "change item without field name skipped");
            continue;
        };

        out.rows.changelog.push(ChangelogRow {
            id: id.clone(),
            item_index: index as i64,
            field,
            issue_key: issue_key.to_string(),
            created: created.clone(),
            author_account_id: author_account_id.clone(),
            author_display_name: author_display_name.clone(),
            field_type: reader.str("fieldtype"),
            from_value: reader.str("from"),
            from_string: reader.str("fromString"),
            to_value: reader.str("to"),
            to_string: reader.str("toString"),
            raw: raw.clone(),
        });
    }
}
