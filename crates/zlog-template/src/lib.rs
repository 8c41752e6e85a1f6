//! Declarative field-mapping output, covering both the HTML and
//! SQL-template variants: an external document names the columns to render, in
//! what order, with what CSS class and SQL type, and this crate drives
//! either an HTML table-per-category render or a parameterized
//! create-table-plus-insert sequence from it.

use serde::Deserialize;
use sqlx::{Postgres, QueryBuilder};

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("rendering template: {0}")]
    Render(#[from] handlebars::RenderError),
    #[error("registering template: {0}")]
    Register(#[from] handlebars::TemplateError),
    #[error("row is missing field `{0}`")]
    MissingField(String),
}

/// One column descriptor in a field-mapping document.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub value: String,
    pub class: Option<String>,
    #[serde(rename = "type")]
    pub sql_type: Option<String>,
}

/// A full field-mapping document: the ordered columns and, for the
/// SQL-template variant, the destination table name.
#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSpec {
    pub table: Option<String>,
    pub fields: Vec<FieldSpec>,
}

const HTML_TEMPLATE: &str = r#"{{#each categories}}
<table class="results-{{this.category}}">
<caption>{{this.category}}</caption>
<tr>{{#each ../fields}}<th class="{{this.class}}">{{this.name}}</th>{{/each}}</tr>
{{#each this.rows}}
<tr>{{#each ../../fields}}<td class="{{this.class}}">{{lookup ../this this.value}}</td>{{/each}}</tr>
{{/each}}
</table>
{{/each}}"#;

/// Renders one `<table>` per category, columns driven by `spec.fields`
/// and color-coded via each field's `class`.
pub fn render_html(
    spec: &TemplateSpec,
    categories: &[(String, Vec<serde_json::Value>)],
) -> Result<String, TemplateError> {
    let mut hb = handlebars::Handlebars::new();
    hb.register_template_string("results", HTML_TEMPLATE)?;

    let data = serde_json::json!({
        "fields": spec.fields.iter().map(|f| serde_json::json!({
            "name": f.name,
            "class": f.class.clone().unwrap_or_default(),
            "value": f.value,
        })).collect::<Vec<_>>(),
        "categories": categories.iter().map(|(cat, rows)| serde_json::json!({
            "category": cat,
            "rows": rows,
        })).collect::<Vec<_>>(),
    });

    Ok(hb.render("results", &data)?)
}

/// `CREATE TABLE IF NOT EXISTS` DDL synthesized from the field list, used
/// when the destination table named in the document does not exist yet.
pub fn build_create_table(table: &str, fields: &[FieldSpec]) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|f| format!("{} {}", f.name, f.sql_type.clone().unwrap_or_else(|| "TEXT".to_owned())))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table} ({})",
        columns.join(", ")
    )
}

/// Builds a parameterized multi-row `INSERT` over `rows`, pulling each
/// field's value out of the row object by the field's `value` key.
pub fn build_insert<'a>(
    table: &str,
    fields: &'a [FieldSpec],
    rows: &'a [serde_json::Value],
) -> Result<QueryBuilder<'a, Postgres>, TemplateError> {
    let column_list = fields
        .iter()
        .map(|f| f.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    let mut qb: QueryBuilder<Postgres> =
        QueryBuilder::new(format!("INSERT INTO {table} ({column_list}) "));

    qb.push_values(rows, |mut b, row| {
        for field in fields {
            let value = row.get(&field.value).cloned().unwrap_or(serde_json::Value::Null);
            b.push_bind(value);
        }
    });

    Ok(qb)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> TemplateSpec {
        TemplateSpec {
            table: Some("results".into()),
            fields: vec![
                FieldSpec {
                    name: "position".into(),
                    value: "position".into(),
                    class: Some("pos".into()),
                    sql_type: Some("INTEGER".into()),
                },
                FieldSpec {
                    name: "rider".into(),
                    value: "rider_name".into(),
                    class: None,
                    sql_type: Some("TEXT".into()),
                },
            ],
        }
    }

    #[test]
    fn renders_a_table_per_category() {
        let spec = spec();
        let categories = vec![(
            "A".to_owned(),
            vec![serde_json::json!({"position": 1, "rider_name": "Alice"})],
        )];
        let html = render_html(&spec, &categories).unwrap();
        assert!(html.contains("results-A"));
        assert!(html.contains("Alice"));
    }

    #[test]
    fn create_table_ddl_uses_declared_types() {
        let spec = spec();
        let ddl = build_create_table("results", &spec.fields);
        assert!(ddl.contains("position INTEGER"));
        assert!(ddl.contains("rider TEXT"));
    }

    #[test]
    fn insert_builder_binds_one_row_per_input() {
        let spec = spec();
        let rows = vec![serde_json::json!({"position": 1, "rider_name": "Alice"})];
        let mut qb = build_insert("results", &spec.fields, &rows).unwrap();
        let built = qb.build();
        assert!(built.sql().starts_with("INSERT INTO results (position, rider) "));
    }
}
