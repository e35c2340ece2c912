pub const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS suites (
  suite_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  name TEXT NOT NULL,
  evaluator_config TEXT NOT NULL,
  version INTEGER NOT NULL,
  created_by TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_by TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  UNIQUE (tenant_id, name)
);
CREATE INDEX IF NOT EXISTS idx_suites_tenant ON suites(tenant_id, suite_id);

CREATE TABLE IF NOT EXISTS suite_versions (
  tenant_id TEXT NOT NULL,
  suite_id INTEGER NOT NULL,
  version INTEGER NOT NULL,
  name TEXT NOT NULL,
  evaluator_config TEXT NOT NULL,
  updated_by TEXT NOT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, suite_id, version)
);

CREATE TABLE IF NOT EXISTS cases (
  case_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  suite_id INTEGER NOT NULL,
  evaluator_kinds TEXT NOT NULL,
  expected TEXT NOT NULL,
  user_input TEXT NOT NULL,
  context TEXT NOT NULL,
  source_conversation_id TEXT,
  version INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_cases_tenant_suite ON cases(tenant_id, suite_id, case_id);

CREATE TABLE IF NOT EXISTS case_versions (
  tenant_id TEXT NOT NULL,
  case_id INTEGER NOT NULL,
  version INTEGER NOT NULL,
  evaluator_kinds TEXT NOT NULL,
  expected TEXT NOT NULL,
  user_input TEXT NOT NULL,
  context TEXT NOT NULL,
  source_conversation_id TEXT,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (tenant_id, case_id, version)
);

CREATE TABLE IF NOT EXISTS executions (
  execution_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  suite_id INTEGER NOT NULL,
  suite_version INTEGER NOT NULL,
  status TEXT NOT NULL,
  progress_pct INTEGER NOT NULL DEFAULT 0,
  summary TEXT,
  idempotency_key TEXT,
  params TEXT NOT NULL,
  error_kind TEXT,
  started_at TEXT NOT NULL,
  finished_at TEXT
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_executions_idem
  ON executions(tenant_id, suite_id, idempotency_key)
  WHERE idempotency_key IS NOT NULL;
CREATE INDEX IF NOT EXISTS idx_executions_tenant ON executions(tenant_id, execution_id);
CREATE INDEX IF NOT EXISTS idx_executions_suite ON executions(tenant_id, suite_id, execution_id);

CREATE TABLE IF NOT EXISTS case_results (
  result_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  execution_id INTEGER NOT NULL,
  case_id INTEGER NOT NULL,
  case_version INTEGER NOT NULL,
  evaluator_kind TEXT NOT NULL,
  status TEXT NOT NULL,
  score REAL,
  passed INTEGER,
  reasoning TEXT,
  system_response TEXT,
  latency_ms INTEGER,
  error_kind TEXT,
  created_at TEXT NOT NULL,
  finished_at TEXT,
  UNIQUE (tenant_id, execution_id, case_id, evaluator_kind)
);
CREATE INDEX IF NOT EXISTS idx_case_results_exec ON case_results(tenant_id, execution_id, case_id);

CREATE TABLE IF NOT EXISTS jobs (
  job_id INTEGER PRIMARY KEY AUTOINCREMENT,
  tenant_id TEXT NOT NULL,
  execution_id INTEGER NOT NULL,
  status TEXT NOT NULL,
  attempts INTEGER NOT NULL DEFAULT 0,
  visible_at_ms INTEGER NOT NULL,
  enqueued_at TEXT NOT NULL,
  UNIQUE (tenant_id, execution_id)
);
CREATE INDEX IF NOT EXISTS idx_jobs_ready ON jobs(status, visible_at_ms);

CREATE TABLE IF NOT EXISTS dead_letters (
  job_id INTEGER PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  execution_id INTEGER NOT NULL,
  attempts INTEGER NOT NULL,
  last_error TEXT,
  failed_at TEXT NOT NULL
);
"#;
