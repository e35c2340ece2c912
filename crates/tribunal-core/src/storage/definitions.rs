use crate::context::{capability, Context};
use crate::errors::{CoreError, Result};
use crate::model::{
    CasePayload, FieldChange, Page, Suite, SuiteDiff, SuitePatch, TestCase,
};
use crate::storage::filter::{self, ListQuery};
use crate::storage::{now_rfc3339, Db};
use rusqlite::{params, params_from_iter, OptionalExtension, Row, TransactionBehavior};

const SUITE_FIELDS: &[&str] = &[
    "name",
    "version",
    "created_by",
    "updated_by",
    "created_at",
    "updated_at",
];

const MAX_NAME_LEN: usize = 200;

/// Historical suite definition as stored in the `_versions` sibling.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SuiteVersion {
    pub suite_id: i64,
    pub version: i64,
    pub name: String,
    pub evaluator_config: serde_json::Value,
    pub updated_by: String,
    pub updated_at: String,
}

/// Versioned persistence of suites and test cases, scoped by tenant.
#[derive(Clone)]
pub struct DefinitionStore {
    db: Db,
}

impl DefinitionStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub fn create_suite(
        &self,
        ctx: &Context,
        name: &str,
        evaluator_config: serde_json::Value,
    ) -> Result<Suite> {
        ctx.require(capability::SUITE_WRITE)?;
        validate_name(name)?;
        let config_json = serde_json::to_string(&evaluator_config)?;
        let now = now_rfc3339();

        let mut conn = self.db.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let inserted = tx.execute(
            "INSERT INTO suites(tenant_id, name, evaluator_config, version, created_by, created_at, updated_by, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5, ?4, ?5)",
            params![ctx.tenant_id, name, config_json, ctx.user_id, now],
        );
        match inserted {
            Ok(_) => {}
            Err(e) => {
                return Err(match CoreError::from(e) {
                    CoreError::Conflict(_) => {
                        CoreError::Conflict(format!("suite name already exists: {}", name))
                    }
                    other => other,
                })
            }
        }
        let suite_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO suite_versions(tenant_id, suite_id, version, name, evaluator_config, updated_by, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6)",
            params![ctx.tenant_id, suite_id, name, config_json, ctx.user_id, now],
        )?;
        tx.commit()?;
        drop(conn);

        tracing::info!(event = "suite_created", tenant = %ctx.tenant_id, suite_id, name);
        self.get_suite(ctx, suite_id)
    }

    pub fn get_suite(&self, ctx: &Context, suite_id: i64) -> Result<Suite> {
        ctx.require(capability::SUITE_READ)?;
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            "SELECT suite_id, tenant_id, name, evaluator_config, version, created_by, created_at, updated_by, updated_at
             FROM suites WHERE tenant_id = ?1 AND suite_id = ?2",
            params![ctx.tenant_id, suite_id],
            suite_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("suite {}", suite_id)))
    }

    /// Appends the new definition to the history sibling and bumps the
    /// version, all in one transaction. Losers of a concurrent update see
    /// `StaleVersion` when they passed `expected_version`.
    pub fn update_suite(&self, ctx: &Context, suite_id: i64, patch: &SuitePatch) -> Result<Suite> {
        ctx.require(capability::SUITE_WRITE)?;
        if let Some(name) = &patch.name {
            validate_name(name)?;
        }

        let mut conn = self.db.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx
            .query_row(
                "SELECT suite_id, tenant_id, name, evaluator_config, version, created_by, created_at, updated_by, updated_at
                 FROM suites WHERE tenant_id = ?1 AND suite_id = ?2",
                params![ctx.tenant_id, suite_id],
                suite_from_row,
            )
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("suite {}", suite_id)))?;

        if let Some(expected) = patch.expected_version {
            if expected != current.version {
                return Err(CoreError::StaleVersion {
                    expected,
                    found: current.version,
                });
            }
        }

        let name = patch.name.clone().unwrap_or_else(|| current.name.clone());
        let config = patch
            .evaluator_config
            .clone()
            .unwrap_or_else(|| current.evaluator_config.clone());
        let config_json = serde_json::to_string(&config)?;
        let next_version = current.version + 1;
        let now = now_rfc3339();

        let changed = tx.execute(
            "UPDATE suites SET name = ?1, evaluator_config = ?2, version = ?3, updated_by = ?4, updated_at = ?5
             WHERE tenant_id = ?6 AND suite_id = ?7 AND version = ?8",
            params![
                name,
                config_json,
                next_version,
                ctx.user_id,
                now,
                ctx.tenant_id,
                suite_id,
                current.version
            ],
        )?;
        if changed == 0 {
            // raced with another writer inside the same process
            return Err(CoreError::StaleVersion {
                expected: current.version,
                found: current.version + 1,
            });
        }
        tx.execute(
            "INSERT INTO suite_versions(tenant_id, suite_id, version, name, evaluator_config, updated_by, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![ctx.tenant_id, suite_id, next_version, name, config_json, ctx.user_id, now],
        )?;
        tx.commit()?;
        drop(conn);

        tracing::info!(event = "suite_updated", tenant = %ctx.tenant_id, suite_id, version = next_version);
        self.get_suite(ctx, suite_id)
    }

    pub fn add_case(&self, ctx: &Context, suite_id: i64, payload: &CasePayload) -> Result<TestCase> {
        ctx.require(capability::SUITE_WRITE)?;
        validate_case(payload)?;
        // ownership check doubles as the NotFound gate
        self.get_suite(ctx, suite_id)?;

        let kinds_json = serde_json::to_string(&payload.evaluator_kinds)?;
        let expected_json = serde_json::to_string(&payload.expected)?;
        let context_json = serde_json::to_string(&payload.context)?;
        let now = now_rfc3339();

        let mut conn = self.db.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO cases(tenant_id, suite_id, evaluator_kinds, expected, user_input, context, source_conversation_id, version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?8)",
            params![
                ctx.tenant_id,
                suite_id,
                kinds_json,
                expected_json,
                payload.user_input,
                context_json,
                payload.source_conversation_id,
                now
            ],
        )?;
        let case_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO case_versions(tenant_id, case_id, version, evaluator_kinds, expected, user_input, context, source_conversation_id, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                ctx.tenant_id,
                case_id,
                kinds_json,
                expected_json,
                payload.user_input,
                context_json,
                payload.source_conversation_id,
                now
            ],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_case(ctx, case_id)
    }

    pub fn update_case(
        &self,
        ctx: &Context,
        case_id: i64,
        payload: &CasePayload,
        expected_version: Option<i64>,
    ) -> Result<TestCase> {
        ctx.require(capability::SUITE_WRITE)?;
        validate_case(payload)?;

        let mut conn = self.db.conn.lock().unwrap();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                "SELECT case_id, tenant_id, suite_id, evaluator_kinds, expected, user_input, context, source_conversation_id, version
                 FROM cases WHERE tenant_id = ?1 AND case_id = ?2",
                params![ctx.tenant_id, case_id],
                case_from_row,
            )
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("case {}", case_id)))?;

        if let Some(expected) = expected_version {
            if expected != current.version {
                return Err(CoreError::StaleVersion {
                    expected,
                    found: current.version,
                });
            }
        }

        let kinds_json = serde_json::to_string(&payload.evaluator_kinds)?;
        let expected_json = serde_json::to_string(&payload.expected)?;
        let context_json = serde_json::to_string(&payload.context)?;
        let next_version = current.version + 1;
        let now = now_rfc3339();

        tx.execute(
            "UPDATE cases SET evaluator_kinds = ?1, expected = ?2, user_input = ?3, context = ?4, source_conversation_id = ?5, version = ?6, updated_at = ?7
             WHERE tenant_id = ?8 AND case_id = ?9",
            params![
                kinds_json,
                expected_json,
                payload.user_input,
                context_json,
                payload.source_conversation_id,
                next_version,
                now,
                ctx.tenant_id,
                case_id
            ],
        )?;
        tx.execute(
            "INSERT INTO case_versions(tenant_id, case_id, version, evaluator_kinds, expected, user_input, context, source_conversation_id, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                ctx.tenant_id,
                case_id,
                next_version,
                kinds_json,
                expected_json,
                payload.user_input,
                context_json,
                payload.source_conversation_id,
                now
            ],
        )?;
        tx.commit()?;
        drop(conn);

        self.get_case(ctx, case_id)
    }

    pub fn get_case(&self, ctx: &Context, case_id: i64) -> Result<TestCase> {
        ctx.require(capability::SUITE_READ)?;
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            "SELECT case_id, tenant_id, suite_id, evaluator_kinds, expected, user_input, context, source_conversation_id, version
             FROM cases WHERE tenant_id = ?1 AND case_id = ?2",
            params![ctx.tenant_id, case_id],
            case_from_row,
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("case {}", case_id)))
    }

    pub fn list_suites(&self, ctx: &Context, query: &ListQuery) -> Result<Page<Suite>> {
        ctx.require(capability::SUITE_READ)?;
        let limit = query.limit.clamp(1, 500);
        let built = filter::build(&ctx.tenant_id, query, SUITE_FIELDS, "suite_id")?;

        let conn = self.db.conn.lock().unwrap();
        let sql = format!(
            "SELECT suite_id, tenant_id, name, evaluator_config, version, created_by, created_at, updated_by, updated_at
             FROM suites WHERE {} {} LIMIT {}",
            built.where_sql,
            built.order_sql,
            limit + 1
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(built.params.iter()), suite_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            items.push(row?);
        }

        let next_cursor = if items.len() > limit {
            items.truncate(limit);
            items
                .last()
                .map(|s| filter::encode_cursor(suite_sort_value(s, &built.sort_field), s.suite_id))
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    pub fn list_suite_versions(&self, ctx: &Context, suite_id: i64) -> Result<Vec<SuiteVersion>> {
        ctx.require(capability::SUITE_READ)?;
        self.get_suite(ctx, suite_id)?;
        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT suite_id, version, name, evaluator_config, updated_by, updated_at
             FROM suite_versions WHERE tenant_id = ?1 AND suite_id = ?2 ORDER BY version ASC",
        )?;
        let rows = stmt.query_map(params![ctx.tenant_id, suite_id], |r| {
            Ok(SuiteVersion {
                suite_id: r.get(0)?,
                version: r.get(1)?,
                name: r.get(2)?,
                evaluator_config: parse_json_col(r.get::<_, String>(3)?),
                updated_by: r.get(4)?,
                updated_at: r.get(5)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Immutable snapshot for an execution. Omitting `version` pins the
    /// current one; passing it reads the history sibling.
    pub fn get_suite_for_execution(
        &self,
        ctx: &Context,
        suite_id: i64,
        version: Option<i64>,
    ) -> Result<(Suite, Vec<TestCase>)> {
        ctx.require(capability::SUITE_READ)?;
        let current = self.get_suite(ctx, suite_id)?;
        let suite = match version {
            None => current,
            Some(v) if v == current.version => current,
            Some(v) => {
                let hist = self.get_version(ctx, suite_id, v)?;
                Suite {
                    name: hist.name,
                    evaluator_config: hist.evaluator_config,
                    version: hist.version,
                    updated_by: hist.updated_by,
                    updated_at: hist.updated_at,
                    ..current
                }
            }
        };

        let conn = self.db.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT case_id, tenant_id, suite_id, evaluator_kinds, expected, user_input, context, source_conversation_id, version
             FROM cases WHERE tenant_id = ?1 AND suite_id = ?2 ORDER BY case_id ASC",
        )?;
        let rows = stmt.query_map(params![ctx.tenant_id, suite_id], case_from_row)?;
        let mut cases = Vec::new();
        for row in rows {
            cases.push(row?);
        }
        Ok((suite, cases))
    }

    pub fn compare_suite_versions(
        &self,
        ctx: &Context,
        suite_id: i64,
        v1: i64,
        v2: i64,
    ) -> Result<SuiteDiff> {
        let a = self.get_version(ctx, suite_id, v1)?;
        let b = self.get_version(ctx, suite_id, v2)?;

        let mut diff = SuiteDiff::default();
        if a.name != b.name {
            diff.changed.insert(
                "name".into(),
                FieldChange {
                    from: serde_json::json!(a.name),
                    to: serde_json::json!(b.name),
                },
            );
        }
        if a.evaluator_config != b.evaluator_config {
            diff.changed.insert(
                "evaluator_config".into(),
                FieldChange {
                    from: a.evaluator_config,
                    to: b.evaluator_config,
                },
            );
        }
        Ok(diff)
    }

    /// Re-publishes a historical definition as a new version; the counter
    /// never rewinds.
    pub fn restore_suite(&self, ctx: &Context, suite_id: i64, version: i64) -> Result<Suite> {
        let hist = self.get_version(ctx, suite_id, version)?;
        self.update_suite(
            ctx,
            suite_id,
            &SuitePatch {
                name: Some(hist.name),
                evaluator_config: Some(hist.evaluator_config),
                expected_version: None,
            },
        )
    }

    fn get_version(&self, ctx: &Context, suite_id: i64, version: i64) -> Result<SuiteVersion> {
        ctx.require(capability::SUITE_READ)?;
        let conn = self.db.conn.lock().unwrap();
        conn.query_row(
            "SELECT suite_id, version, name, evaluator_config, updated_by, updated_at
             FROM suite_versions WHERE tenant_id = ?1 AND suite_id = ?2 AND version = ?3",
            params![ctx.tenant_id, suite_id, version],
            |r| {
                Ok(SuiteVersion {
                    suite_id: r.get(0)?,
                    version: r.get(1)?,
                    name: r.get(2)?,
                    evaluator_config: parse_json_col(r.get::<_, String>(3)?),
                    updated_by: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            },
        )
        .optional()?
        .ok_or_else(|| CoreError::NotFound(format!("suite {} version {}", suite_id, version)))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(CoreError::Invalid("suite name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(CoreError::Invalid(format!(
            "suite name exceeds {} characters",
            MAX_NAME_LEN
        )));
    }
    Ok(())
}

fn validate_case(payload: &CasePayload) -> Result<()> {
    if payload.evaluator_kinds.is_empty() {
        return Err(CoreError::Invalid(
            "case must target at least one evaluator kind".into(),
        ));
    }
    if payload.user_input.trim().is_empty() {
        return Err(CoreError::Invalid("case user_input must not be empty".into()));
    }
    for (kind, exp) in &payload.expected {
        if let Some(s) = exp.min_score {
            if !(0.0..=1.0).contains(&s) {
                return Err(CoreError::Invalid(format!(
                    "expected.{}.min_score must be in [0,1]",
                    kind
                )));
            }
        }
    }
    Ok(())
}

fn parse_json_col(s: String) -> serde_json::Value {
    serde_json::from_str(&s).unwrap_or(serde_json::Value::Null)
}

fn suite_from_row(r: &Row<'_>) -> rusqlite::Result<Suite> {
    Ok(Suite {
        suite_id: r.get(0)?,
        tenant_id: r.get(1)?,
        name: r.get(2)?,
        evaluator_config: parse_json_col(r.get::<_, String>(3)?),
        version: r.get(4)?,
        created_by: r.get(5)?,
        created_at: r.get(6)?,
        updated_by: r.get(7)?,
        updated_at: r.get(8)?,
    })
}

fn case_from_row(r: &Row<'_>) -> rusqlite::Result<TestCase> {
    let kinds: Vec<String> =
        serde_json::from_str(&r.get::<_, String>(3)?).unwrap_or_default();
    let expected = serde_json::from_str(&r.get::<_, String>(4)?).unwrap_or_default();
    Ok(TestCase {
        case_id: r.get(0)?,
        tenant_id: r.get(1)?,
        suite_id: r.get(2)?,
        evaluator_kinds: kinds,
        expected,
        user_input: r.get(5)?,
        context: parse_json_col(r.get::<_, String>(6)?),
        source_conversation_id: r.get(7)?,
        version: r.get(8)?,
    })
}

fn suite_sort_value(s: &Suite, field: &str) -> serde_json::Value {
    match field {
        "name" => serde_json::json!(s.name),
        "version" => serde_json::json!(s.version),
        "created_by" => serde_json::json!(s.created_by),
        "updated_by" => serde_json::json!(s.updated_by),
        "created_at" => serde_json::json!(s.created_at),
        "updated_at" => serde_json::json!(s.updated_at),
        _ => serde_json::json!(s.suite_id),
    }
}
