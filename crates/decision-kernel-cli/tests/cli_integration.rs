use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_dk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_dk"))
        .args(args)
        .output()
        .unwrap_or_else(|err| panic!("failed to execute dk binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_dk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "dk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn as_i64(value: &Value, key: &str) -> i64 {
    value
        .get(key)
        .and_then(Value::as_i64)
        .unwrap_or_else(|| panic!("missing integer field `{key}` in payload: {value}"))
}

fn as_str<'a>(value: &'a Value, key: &str) -> &'a str {
    value
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_else(|| panic!("missing string field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn write_fixture(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body)
        .unwrap_or_else(|err| panic!("failed to write fixture {}: {err}", path.display()));
    path
}

const POLICY_YAML: &str = r"
meta:
  policy_id: procurement-default
  version: '2024.1'
selectors:
  - selector_id: mro-contract
    priority: 1
    when:
      - signal: category
        op: eq
        value: MRO
    technique: CONTRACT_BASELINE
    rule_set: rs-price
rule_sets:
  - rule_set_id: rs-price
    version: '1'
    rules:
      - rule_id: PRICE-01
        severity: high
        min_confidence: 0.4
        logic:
          compare:
            fact: unit_price_benchmark
            op: lte
            value: 150.0
";

const EXTRACT_JSON: &str = r#"{
  "price_items": [
    {"fact_key": "unit_price_benchmark", "unit_price": 118.0, "currency": "THB", "page_anchor": 3, "extraction_confidence": 0.9},
    {"fact_key": "unit_price_benchmark", "unit_price": 120.0, "currency": "THB", "page_anchor": 3, "extraction_confidence": 0.9},
    {"fact_key": "unit_price_benchmark", "unit_price": 124.0, "currency": "THB", "page_anchor": 4, "extraction_confidence": 0.85}
  ],
  "clauses": [
    {"text": "Pricing fixed per PO-2024-0042 appendix B.", "page_anchor": 12, "extraction_confidence": 0.95}
  ]
}"#;

#[test]
fn db_migrate_reports_versions_and_contract() {
    let dir = unique_temp_dir("dk-cli-migrate");
    let db = dir.join("kernel.sqlite3");
    let db = path_str(&db);

    let planned = run_json(["--db", db, "db", "migrate", "--dry-run"]);
    assert_eq!(as_str(&planned, "contract_version"), "cli.v1");
    assert_eq!(as_i64(&planned, "current_version"), 0);
    assert_eq!(planned["would_apply_versions"], serde_json::json!([1]));

    let applied = run_json(["--db", db, "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 1);

    let status = run_json(["--db", db, "db", "schema-version"]);
    assert_eq!(as_i64(&status, "current_version"), 1);
    assert_eq!(status["up_to_date"], Value::Bool(true));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn full_case_lifecycle_through_the_binary() {
    let dir = unique_temp_dir("dk-cli-lifecycle");
    let db = dir.join("kernel.sqlite3");
    let db = path_str(&db);
    let policy_file = write_fixture(&dir, "policy.yaml", POLICY_YAML);
    let extract_file = write_fixture(&dir, "extract.json", EXTRACT_JSON);

    let case = run_json([
        "--db",
        db,
        "case",
        "create",
        "--vendor-id",
        "V-001",
        "--po-reference",
        "PO-2024-0042",
        "--currency",
        "THB",
        "--signal",
        "category=MRO",
        "--signal",
        "order_value=5020",
    ]);
    let case_id = as_str(&case, "case_id").to_string();
    assert_eq!(case["signals"]["category"], Value::String("MRO".to_string()));
    assert_eq!(case["signals"]["order_value"], serde_json::json!(5020.0));

    let document = run_json([
        "--db",
        db,
        "document",
        "add",
        "--doc-type",
        "contract",
        "--vendor-id",
        "V-001",
        "--readiness",
        "l5",
        "--source-uri",
        "file:///contracts/v-001.pdf",
        "--extract-file",
        path_str(&extract_file),
    ]);
    assert_eq!(as_str(&document, "readiness"), "l5");

    let loaded = run_json([
        "--db",
        db,
        "policy",
        "load",
        "--file",
        path_str(&policy_file),
    ]);
    assert_eq!(as_str(&loaded, "policy_id"), "procurement-default");
    assert_eq!(loaded["activated"], Value::Bool(true));

    let discovered = run_json([
        "--db",
        db,
        "link",
        "discover",
        "--case-id",
        &case_id,
        "--actor",
        "system",
    ]);
    assert_eq!(as_i64(&discovered, "count"), 1);
    let link_id = discovered["proposed"][0]["link_id"]
        .as_str()
        .unwrap_or_else(|| panic!("missing link_id in payload: {discovered}"))
        .to_string();
    assert_eq!(discovered["proposed"][0]["state"], Value::String("inferred".to_string()));

    let confirmed = run_json([
        "--db",
        db,
        "link",
        "confirm",
        "--link-id",
        &link_id,
        "--actor",
        "reviewer-1",
    ]);
    assert_eq!(as_str(&confirmed, "state"), "confirmed");

    let run = run_json(["--db", db, "run", "start", "--case-id", &case_id, "--actor", "reviewer-1"]);
    let run_id = as_str(&run, "run_id").to_string();
    assert_eq!(as_str(&run, "status"), "pending_review");
    assert_eq!(run["requires_escalation"], Value::Bool(false));

    let pack = run_json(["--db", db, "run", "pack", "--case-id", &case_id]);
    let items = pack["items"]
        .as_array()
        .unwrap_or_else(|| panic!("pack items should be an array: {pack}"));
    assert!(items.iter().any(|item| item["tag"] == Value::String("primary".to_string())));

    let decided = run_json([
        "--db",
        db,
        "run",
        "decide",
        "--run-id",
        &run_id,
        "--action",
        "approve",
        "--actor",
        "reviewer-1",
    ]);
    assert_eq!(as_str(&decided, "status"), "approved");

    let latest = run_json(["--db", db, "run", "latest", "--case-id", &case_id]);
    assert_eq!(as_str(&latest, "run_id"), run_id);

    let trail = run_json(["--db", db, "audit", "trail", "--case-id", &case_id]);
    let events = trail["events"]
        .as_array()
        .unwrap_or_else(|| panic!("trail events should be an array: {trail}"));
    let types: Vec<&str> = events
        .iter()
        .map(|event| {
            event["event_type"]
                .as_str()
                .unwrap_or_else(|| panic!("event_type should be a string: {event}"))
        })
        .collect();
    assert_eq!(types.first().copied(), Some("LINK_INFERRED"));
    assert_eq!(types.last().copied(), Some("RUN_APPROVED"));
    assert!(types.contains(&"PACK_BUILT"));

    let summary = run_json(["--db", db, "case", "summary", "--case-id", &case_id]);
    assert_eq!(summary["link_counts"]["confirmed"], serde_json::json!(1));
    assert_eq!(summary["latest_run"]["status"], Value::String("approved".to_string()));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn escalate_without_rationale_fails() {
    let dir = unique_temp_dir("dk-cli-rationale");
    let db = dir.join("kernel.sqlite3");
    let db = path_str(&db);
    let policy_file = write_fixture(&dir, "policy.yaml", POLICY_YAML);
    let extract_file = write_fixture(&dir, "extract.json", EXTRACT_JSON);

    let case = run_json([
        "--db",
        db,
        "case",
        "create",
        "--vendor-id",
        "V-001",
        "--po-reference",
        "PO-2024-0042",
        "--currency",
        "THB",
        "--signal",
        "category=MRO",
    ]);
    let case_id = as_str(&case, "case_id").to_string();
    run_json([
        "--db",
        db,
        "document",
        "add",
        "--doc-type",
        "contract",
        "--vendor-id",
        "V-001",
        "--readiness",
        "l5",
        "--source-uri",
        "file:///contracts/v-001.pdf",
        "--extract-file",
        path_str(&extract_file),
    ]);
    run_json(["--db", db, "policy", "load", "--file", path_str(&policy_file)]);
    let discovered = run_json([
        "--db",
        db,
        "link",
        "discover",
        "--case-id",
        &case_id,
        "--actor",
        "system",
    ]);
    let link_id = discovered["proposed"][0]["link_id"]
        .as_str()
        .unwrap_or_else(|| panic!("missing link_id in payload: {discovered}"))
        .to_string();
    run_json(["--db", db, "link", "confirm", "--link-id", &link_id, "--actor", "reviewer-1"]);
    let run = run_json(["--db", db, "run", "start", "--case-id", &case_id, "--actor", "reviewer-1"]);
    let run_id = as_str(&run, "run_id").to_string();

    let output = run_dk([
        "--db",
        db,
        "run",
        "decide",
        "--run-id",
        &run_id,
        "--action",
        "escalate",
        "--actor",
        "reviewer-1",
    ]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("rationale"), "stderr should mention rationale: {stderr}");

    let latest = run_json(["--db", db, "run", "latest", "--case-id", &case_id]);
    assert_eq!(as_str(&latest, "status"), "pending_review");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn run_start_without_policy_fails_cleanly() {
    let dir = unique_temp_dir("dk-cli-nopolicy");
    let db = dir.join("kernel.sqlite3");
    let db = path_str(&db);

    let case = run_json([
        "--db",
        db,
        "case",
        "create",
        "--vendor-id",
        "V-009",
        "--po-reference",
        "PO-2024-0099",
        "--currency",
        "THB",
    ]);
    let case_id = as_str(&case, "case_id").to_string();

    let output = run_dk(["--db", db, "run", "start", "--case-id", &case_id, "--actor", "system"]);
    assert!(!output.status.success());

    let _ = fs::remove_dir_all(&dir);
}
