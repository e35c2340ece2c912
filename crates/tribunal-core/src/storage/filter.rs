use crate::errors::{CoreError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

/// Per-field operators supported by list queries.
#[derive(Debug, Clone)]
pub enum FilterOp {
    Eq(serde_json::Value),
    In(Vec<serde_json::Value>),
    /// Case-insensitive substring match.
    Contains(String),
    Gte(serde_json::Value),
    Lte(serde_json::Value),
    /// Pairwise field inequality, e.g. updated_by != created_by.
    NeField(String),
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
}

#[derive(Debug, Clone)]
pub struct Sort {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone)]
pub struct ListQuery {
    pub filters: Vec<Filter>,
    pub sort: Option<Sort>,
    pub limit: usize,
    pub cursor: Option<String>,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            filters: Vec::new(),
            sort: None,
            limit: 50,
            cursor: None,
        }
    }
}

/// Cursor payload. Opaque to clients: base64 of `{v, id}` where `v` is the
/// last row's sort-key value and `id` the primary-key tiebreaker.
#[derive(Debug, Serialize, Deserialize)]
struct Cursor {
    v: serde_json::Value,
    id: i64,
}

pub fn encode_cursor(sort_value: serde_json::Value, id: i64) -> String {
    let raw = serde_json::to_vec(&Cursor { v: sort_value, id }).unwrap_or_default();
    URL_SAFE_NO_PAD.encode(raw)
}

fn decode_cursor(s: &str) -> Result<Cursor> {
    let raw = URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|_| CoreError::Invalid("malformed cursor".into()))?;
    serde_json::from_slice(&raw).map_err(|_| CoreError::Invalid("malformed cursor".into()))
}

fn to_sql_value(v: &serde_json::Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sv;
    Ok(match v {
        serde_json::Value::Null => Sv::Null,
        serde_json::Value::Bool(b) => Sv::Integer(*b as i64),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Sv::Integer(i)
            } else if let Some(f) = n.as_f64() {
                Sv::Real(f)
            } else {
                return Err(CoreError::Invalid("unsupported numeric filter value".into()));
            }
        }
        serde_json::Value::String(s) => Sv::Text(s.clone()),
        _ => return Err(CoreError::Invalid("unsupported filter value".into())),
    })
}

/// SQL fragments built from a `ListQuery` against a whitelisted field set.
#[derive(Debug)]
pub struct BuiltQuery {
    pub where_sql: String,
    pub order_sql: String,
    pub params: Vec<rusqlite::types::Value>,
    pub sort_field: String,
}

/// Builds tenant-scoped WHERE/ORDER BY clauses. Every referenced field must
/// be in `fields`; the primary key `pk` is always appended as tiebreaker so
/// sort order is stable under pagination.
pub fn build(
    tenant_id: &str,
    query: &ListQuery,
    fields: &[&str],
    pk: &str,
) -> Result<BuiltQuery> {
    let check = |f: &str| -> Result<()> {
        if fields.contains(&f) || f == pk {
            Ok(())
        } else {
            Err(CoreError::Invalid(format!("unknown filter field: {}", f)))
        }
    };

    let mut where_parts = vec!["tenant_id = ?".to_string()];
    let mut params: Vec<rusqlite::types::Value> =
        vec![rusqlite::types::Value::Text(tenant_id.to_string())];

    for f in &query.filters {
        check(&f.field)?;
        match &f.op {
            FilterOp::Eq(v) => {
                where_parts.push(format!("{} = ?", f.field));
                params.push(to_sql_value(v)?);
            }
            FilterOp::In(vs) => {
                if vs.is_empty() {
                    where_parts.push("1 = 0".into());
                    continue;
                }
                let marks = vec!["?"; vs.len()].join(", ");
                where_parts.push(format!("{} IN ({})", f.field, marks));
                for v in vs {
                    params.push(to_sql_value(v)?);
                }
            }
            FilterOp::Contains(s) => {
                where_parts.push(format!("LOWER({}) LIKE '%' || LOWER(?) || '%'", f.field));
                params.push(rusqlite::types::Value::Text(s.clone()));
            }
            FilterOp::Gte(v) => {
                where_parts.push(format!("{} >= ?", f.field));
                params.push(to_sql_value(v)?);
            }
            FilterOp::Lte(v) => {
                where_parts.push(format!("{} <= ?", f.field));
                params.push(to_sql_value(v)?);
            }
            FilterOp::NeField(other) => {
                check(other)?;
                where_parts.push(format!("{} <> {}", f.field, other));
            }
        }
    }

    let (sort_field, descending) = match &query.sort {
        Some(s) => {
            check(&s.field)?;
            (s.field.clone(), s.descending)
        }
        None => (pk.to_string(), false),
    };

    if let Some(cur) = &query.cursor {
        let cur = decode_cursor(cur)?;
        let cmp = if descending { "<" } else { ">" };
        where_parts.push(format!(
            "({sf} {cmp} ? OR ({sf} = ? AND {pk} {cmp} ?))",
            sf = sort_field,
            cmp = cmp,
            pk = pk
        ));
        let v = to_sql_value(&cur.v)?;
        params.push(v.clone());
        params.push(v);
        params.push(rusqlite::types::Value::Integer(cur.id));
    }

    let dir = if descending { "DESC" } else { "ASC" };
    Ok(BuiltQuery {
        where_sql: where_parts.join(" AND "),
        order_sql: format!("ORDER BY {} {}, {} {}", sort_field, dir, pk, dir),
        params,
        sort_field,
    })
}
