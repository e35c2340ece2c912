//! YAML suite seeding: the file format mirrors what the HTTP edge accepts,
//! batched for local setup and CI fixtures.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use tribunal_core::context::{Context, Role};
use tribunal_core::errors::{CoreError, Result};
use tribunal_core::model::{CasePayload, Expectation};
use tribunal_core::storage::DefinitionStore;

#[derive(Debug, Deserialize)]
pub struct SeedFile {
    pub tenant: String,
    #[serde(default = "default_seeded_by")]
    pub seeded_by: String,
    pub suites: Vec<SeedSuite>,
}

#[derive(Debug, Deserialize)]
pub struct SeedSuite {
    pub name: String,
    #[serde(default)]
    pub evaluator_config: serde_json::Value,
    #[serde(default)]
    pub cases: Vec<SeedCase>,
}

#[derive(Debug, Deserialize)]
pub struct SeedCase {
    pub user_input: String,
    pub evaluator_kinds: Vec<String>,
    #[serde(default)]
    pub expected: BTreeMap<String, Expectation>,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
}

fn default_seeded_by() -> String {
    "seed".to_string()
}

#[derive(Debug)]
pub struct SeedReport {
    pub suites: usize,
    pub cases: usize,
}

pub fn load_file(store: &DefinitionStore, path: &Path) -> Result<SeedReport> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| CoreError::Invalid(format!("failed to read {}: {}", path.display(), e)))?;
    let file: SeedFile = serde_yaml::from_str(&raw)
        .map_err(|e| CoreError::Invalid(format!("failed to parse {}: {}", path.display(), e)))?;

    if file.suites.is_empty() {
        return Err(CoreError::Invalid("seed file has no suites".into()));
    }

    let ctx = Context::new(&file.tenant, Role::Admin, &file.seeded_by);
    let mut report = SeedReport { suites: 0, cases: 0 };

    for suite_def in file.suites {
        let suite = store.create_suite(&ctx, &suite_def.name, suite_def.evaluator_config)?;
        report.suites += 1;
        for case in suite_def.cases {
            store.add_case(
                &ctx,
                suite.suite_id,
                &CasePayload {
                    evaluator_kinds: case.evaluator_kinds,
                    expected: case.expected,
                    user_input: case.user_input,
                    context: case.context,
                    source_conversation_id: case.source_conversation_id,
                },
            )?;
            report.cases += 1;
        }
    }
    Ok(report)
}

pub fn write_sample(path: &Path) -> Result<()> {
    if path.exists() {
        return Err(CoreError::Invalid(format!(
            "{} already exists",
            path.display()
        )));
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Internal(e.to_string()))?;
        }
    }
    std::fs::write(
        path,
        r#"tenant: demo
suites:
  - name: smoke
    evaluator_config:
      judge_model: default
    cases:
      - user_input: "What is the capital of France?"
        evaluator_kinds: [answer_relevancy, faithfulness]
        expected:
          answer_relevancy:
            min_score: 0.5
        context:
          docs: ["Paris is the capital of France."]
"#,
    )
    .map_err(|e| CoreError::Internal(e.to_string()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribunal_core::storage::Db;

    #[test]
    fn sample_file_roundtrips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("suites.yaml");
        write_sample(&path).unwrap();

        let db = Db::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let store = DefinitionStore::new(db);
        let report = load_file(&store, &path).unwrap();
        assert_eq!(report.suites, 1);
        assert_eq!(report.cases, 1);

        let ctx = Context::new("demo", Role::Admin, "seed");
        let (suite, cases) = store.get_suite_for_execution(&ctx, 1, None).unwrap();
        assert_eq!(suite.name, "smoke");
        assert_eq!(cases.len(), 1);
        assert_eq!(
            cases[0].evaluator_kinds,
            vec!["answer_relevancy", "faithfulness"]
        );
    }

    #[test]
    fn rejects_empty_seed_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.yaml");
        std::fs::write(&path, "tenant: demo\nsuites: []\n").unwrap();

        let db = Db::open_in_memory().unwrap();
        db.init_schema().unwrap();
        let store = DefinitionStore::new(db);
        let err = load_file(&store, &path).unwrap_err();
        assert_eq!(err.kind(), "invalid");
    }
}
