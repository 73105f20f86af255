use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use jsonschema::JSONSchema;
use serde_json::{json, Value};

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

fn run_tk<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_tk"))
        .args(args)
        .env_remove("TEXTBOOK_KERNEL_DB")
        .env_remove("TEXTBOOK_KERNEL_QR_BASE_URL")
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute tk binary: {err}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

/// Run a command that must succeed and return its `data` payload.
fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tk(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "tk command failed (status={}):\nstdout:\n{}\nstderr:\n{}",
            output.status, stdout, stderr
        );
    }

    let envelope = parse_stdout(&output);
    validate_schema("envelope.schema.json", &envelope);
    assert_eq!(envelope.get("success"), Some(&Value::Bool(true)));
    envelope.get("data").cloned().unwrap_or(Value::Null)
}

/// Run a command that must fail and return its exit code and envelope.
fn run_failure<I, S>(args: I) -> (i32, Value)
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_tk(args);
    assert!(!output.status.success(), "command unexpectedly succeeded");
    let code = output.status.code().unwrap_or_else(|| panic!("tk terminated by signal"));
    let envelope = parse_stdout(&output);
    validate_schema("envelope.schema.json", &envelope);
    assert_eq!(envelope.get("success"), Some(&Value::Bool(false)));
    (code, envelope)
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

fn as_array<'a>(value: &'a Value, key: &str) -> &'a Vec<Value> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
}

fn path_str(path: &Path) -> &str {
    path.to_str().unwrap_or_else(|| panic!("path should be valid UTF-8: {}", path.display()))
}

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn read_json_file(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read JSON file {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse JSON file {}: {err}", path.display()))
}

fn validate_schema(schema_file: &str, instance: &Value) {
    let schema_path = repo_root().join("contracts/v1/schemas").join(schema_file);
    let schema_json = read_json_file(&schema_path);
    let compiled = JSONSchema::compile(&schema_json)
        .unwrap_or_else(|err| panic!("failed to compile schema {}: {err}", schema_path.display()));

    let errors = compiled
        .validate(instance)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>());
    if let Some(errors) = errors {
        panic!("schema validation failed for {}:\n{}", schema_file, errors.join("\n"));
    }
}

fn write_ndjson(path: &Path, rows: &[Value]) {
    let body = rows.iter().map(Value::to_string).collect::<Vec<_>>().join("\n");
    fs::write(path, format!("{body}\n"))
        .unwrap_or_else(|err| panic!("failed to write NDJSON fixture {}: {err}", path.display()));
}

fn import(db: &Path, collection: &str, file: &Path) -> Value {
    run_json([
        "--db",
        path_str(db),
        "docs",
        "import",
        "--collection",
        collection,
        "--in",
        path_str(file),
    ])
}

#[test]
fn db_commands_cover_schema_migrate_and_integrity() {
    let sandbox = unique_temp_dir("textbook-kernel-cli-db");
    let db = sandbox.join("store.sqlite3");

    let schema_before = run_json(["--db", path_str(&db), "db", "schema-version"]);
    assert_eq!(as_i64(&schema_before, "current_version"), 0);

    let dry_run = run_json(["--db", path_str(&db), "db", "migrate", "--dry-run"]);
    assert_eq!(dry_run.get("would_apply_versions"), Some(&json!([1, 2])));

    let applied = run_json(["--db", path_str(&db), "db", "migrate"]);
    assert_eq!(as_i64(&applied, "after_version"), 2);

    let integrity = run_json(["--db", path_str(&db), "db", "integrity-check"]);
    assert_eq!(integrity.get("quick_check_ok"), Some(&Value::Bool(true)));

    let sqlite_url = format!("sqlite://{}", path_str(&db));
    let via_url = run_json(["--db", sqlite_url.as_str(), "db", "schema-version"]);
    assert_eq!(as_i64(&via_url, "current_version"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn purge_without_qr_deletes_incomplete_mappings_once() {
    let sandbox = unique_temp_dir("textbook-kernel-cli-purge");
    let db = sandbox.join("store.sqlite3");
    let fixture = sandbox.join("mappings.ndjson");
    write_ndjson(
        &fixture,
        &[
            json!({"_id": 1, "textbookId": "t1", "passageSetId": "p1", "order": 1, "qrCode": "ABC"}),
            json!({"_id": 2, "textbookId": "t1", "passageSetId": "p2", "order": 2, "qrCode": ""}),
            json!({"_id": 3, "textbookId": "t1", "passageSetId": "p3", "order": 3}),
        ],
    );
    let imported = import(&db, "textbook_passage_mappings", &fixture);
    assert_eq!(as_i64(&imported, "imported"), 3);
    assert_eq!(as_str(&imported, "sha256").len(), 64);

    let inventory = run_json(["--db", path_str(&db), "mappings", "list"]);
    validate_schema("mapping_inventory.schema.json", &inventory);
    assert_eq!(as_i64(&inventory, "non_exposable_mappings"), 2);

    let preview = run_json(["--db", path_str(&db), "mappings", "purge-without-qr", "--dry-run"]);
    validate_schema("purge_outcome.schema.json", &preview);
    assert_eq!(as_array(&preview, "candidates").len(), 2);
    assert_eq!(as_i64(&preview, "deleted"), 0);

    let purged = run_json(["--db", path_str(&db), "mappings", "purge-without-qr"]);
    validate_schema("purge_outcome.schema.json", &purged);
    assert_eq!(as_i64(&purged, "deleted"), 2);
    assert_eq!(as_i64(&purged, "after"), 1);

    let second = run_json(["--db", path_str(&db), "mappings", "purge-without-qr"]);
    assert_eq!(as_i64(&second, "deleted"), 0);

    let report = run_json(["--db", path_str(&db), "mappings", "report"]);
    assert_eq!(as_i64(&report, "count"), 1);
    assert_eq!(as_array(&report, "mappings")[0].get("qrCode"), Some(&json!("ABC")));

    let tombstones = run_json(["--db", path_str(&db), "tombstones", "list"]);
    let tombstones = tombstones.as_array().unwrap_or_else(|| panic!("tombstones should be a list"));
    assert_eq!(tombstones.len(), 2);
    let tombstone_id = as_str(&tombstones[0], "tombstone_id").to_string();

    let restored = run_json([
        "--db",
        path_str(&db),
        "tombstones",
        "restore",
        "--tombstone-id",
        tombstone_id.as_str(),
    ]);
    assert!(restored.get("restored_at").and_then(Value::as_str).is_some());
    let report = run_json(["--db", path_str(&db), "mappings", "report"]);
    assert_eq!(as_i64(&report, "count"), 2);

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn legacy_passage_sets_are_normalized_and_exposed_through_textbook_view() {
    let sandbox = unique_temp_dir("textbook-kernel-cli-legacy");
    let db = sandbox.join("store.sqlite3");
    let textbooks = sandbox.join("textbooks.ndjson");
    let passage_sets = sandbox.join("passagesets.ndjson");
    write_ndjson(
        &textbooks,
        &[json!({
            "_id": {"$oid": "T1"},
            "title": "Reading Master",
            "subject": "English",
            "level": "high-2",
            "year": 2024,
            "createdAt": {"$date": "2024-03-01T00:00:00Z"},
            "updatedAt": {"$date": "2024-03-01T00:00:00Z"}
        })],
    );
    write_ndjson(
        &passage_sets,
        &[json!({
            "_id": 10,
            "title": "Passage 10",
            "passage": "Once upon a time",
            "textbookId": "T1",
            "setNumber": 2,
            "createdAt": "2024-03-01T00:00:00Z",
            "updatedAt": "2024-03-01T00:00:00Z"
        })],
    );
    import(&db, "textbooks", &textbooks);
    import(&db, "passagesets", &passage_sets);

    let detected = run_json(["--db", path_str(&db), "passage-sets", "detect-legacy"]);
    let detected = detected.as_array().unwrap_or_else(|| panic!("detect-legacy should be a list"));
    assert_eq!(detected.len(), 1);
    assert_eq!(detected[0].get("mapping_exists"), Some(&Value::Bool(false)));

    let output = run_tk(["--db", path_str(&db), "passage-sets", "strip-legacy"]);
    assert!(output.status.success());
    let envelope = parse_stdout(&output);
    validate_schema("envelope.schema.json", &envelope);
    assert!(as_str(&envelope, "message").contains("--create-missing-mappings"));

    let report = run_json([
        "--db",
        path_str(&db),
        "--qr-base-url",
        "https://tutor.example/chat",
        "passage-sets",
        "strip-legacy",
        "--create-missing-mappings",
    ]);
    validate_schema("repair_report.schema.json", &report);
    assert_eq!(as_i64(&report, "normalized"), 1);
    assert_eq!(as_i64(&report, "mappings_created"), 1);
    assert_eq!(as_i64(&report, "remaining_legacy"), 0);

    let views =
        run_json(["--db", path_str(&db), "textbook", "passage-sets", "--textbook-id", "T1"]);
    validate_schema("passage_set_views.schema.json", &views);
    let views = views.as_array().unwrap_or_else(|| panic!("views should be a list"));
    assert_eq!(views.len(), 1);
    assert_eq!(as_i64(&views[0], "order"), 2);
    assert!(as_str(&views[0], "mappingQrCodeUrl").starts_with("https://tutor.example/chat/QR-"));
    assert!(views[0].get("textbookId").is_none());
    assert!(views[0].get("setNumber").is_none());

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn prompt_versions_are_listed_newest_first() {
    let sandbox = unique_temp_dir("textbook-kernel-cli-prompts");
    let db = sandbox.join("store.sqlite3");

    for content in ["Hello v1", "Hello v2", "Hello v3"] {
        run_json([
            "--db",
            path_str(&db),
            "prompts",
            "save",
            "--key",
            "greeting",
            "--name",
            "Greeting",
            "--content",
            content,
        ]);
    }

    let output = run_tk([
        "--db",
        path_str(&db),
        "prompts",
        "save",
        "--key",
        "greeting",
        "--name",
        "Greeting",
        "--content",
        "Hello v3",
    ]);
    assert!(output.status.success());
    let unchanged = parse_stdout(&output);
    assert_eq!(unchanged.pointer("/data/changed"), Some(&Value::Bool(false)));

    let versions = run_json(["--db", path_str(&db), "prompts", "versions", "--key", "greeting"]);
    validate_schema("prompt_versions.schema.json", &versions);
    let numbers = versions
        .as_array()
        .unwrap_or_else(|| panic!("versions should be a list"))
        .iter()
        .map(|version| as_i64(version, "version"))
        .collect::<Vec<_>>();
    assert_eq!(numbers, vec![3, 2, 1]);

    let limited = run_json([
        "--db",
        path_str(&db),
        "prompts",
        "versions",
        "--key",
        "greeting",
        "--order",
        "created-at",
        "--limit",
        "1",
    ]);
    assert_eq!(limited.as_array().map(Vec::len), Some(1));

    let restored = run_json([
        "--db",
        path_str(&db),
        "prompts",
        "restore",
        "--key",
        "greeting",
        "--version",
        "1",
    ]);
    assert_eq!(restored.pointer("/prompt/version"), Some(&json!(4)));
    assert_eq!(restored.pointer("/prompt/content"), Some(&json!("Hello v1")));

    let _ = fs::remove_dir_all(&sandbox);
}

#[test]
fn failures_map_to_error_markers_and_exit_codes() {
    let sandbox = unique_temp_dir("textbook-kernel-cli-errors");
    let db = sandbox.join("store.sqlite3");

    let unreachable = sandbox.join("missing").join("nested").join("store.sqlite3");
    let (code, envelope) = run_failure(["--db", path_str(&unreachable), "mappings", "list"]);
    assert_eq!(code, 2);
    assert!(as_str(&envelope, "message").starts_with("CONNECTION_ERROR: "));

    let mistyped = sandbox.join("stroe.sqlite3");
    for command in [["mappings", "list"], ["mappings", "report"], ["passage-sets", "detect-legacy"]] {
        let (code, envelope) = run_failure(
            ["--db", path_str(&mistyped)].into_iter().chain(command),
        );
        assert_eq!(code, 2);
        assert!(as_str(&envelope, "message").starts_with("CONNECTION_ERROR: "));
        assert!(!mistyped.exists(), "read-only command created {}", mistyped.display());
    }

    let (code, envelope) = run_failure([
        "--db",
        path_str(&db),
        "mappings",
        "unlink",
        "--textbook-id",
        "t1",
        "--passage-set-id",
        "p1",
    ]);
    assert_eq!(code, 3);
    assert!(as_str(&envelope, "message").starts_with("QUERY_ERROR: "));

    let prompts = sandbox.join("prompts.ndjson");
    write_ndjson(
        &prompts,
        &[
            json!({"_id": "a", "key": "greeting"}),
            json!({"_id": "b", "key": "greeting"}),
        ],
    );
    let (code, envelope) = run_failure([
        "--db",
        path_str(&db),
        "docs",
        "import",
        "--collection",
        "systemprompts",
        "--in",
        path_str(&prompts),
    ]);
    assert_eq!(code, 4);
    assert!(as_str(&envelope, "message").starts_with("WRITE_ERROR: "));

    let questions = sandbox.join("questions.ndjson");
    write_ndjson(
        &questions,
        &[json!({
            "_id": "q1",
            "setId": "p1",
            "number": 1,
            "questionText": "Main idea?",
            "options": ["A", "B"],
            "correctAnswer": "A",
            "createdAt": "2024-03-01T00:00:00Z",
            "updatedAt": "2024-03-01T00:00:00Z"
        })],
    );
    import(&db, "questions", &questions);
    let (code, envelope) = run_failure([
        "--db",
        path_str(&db),
        "questions",
        "explanation",
        "--question-id",
        "q1",
        "--status",
        "completed",
        "--text",
        "Because A.",
    ]);
    assert_eq!(code, 5);
    assert!(as_str(&envelope, "message").starts_with("VALIDATION_ERROR: "));

    let started = run_json([
        "--db",
        path_str(&db),
        "questions",
        "explanation",
        "--question-id",
        "q1",
        "--status",
        "generating",
    ]);
    assert_eq!(as_str(&started, "explanationStatus"), "generating");

    let _ = fs::remove_dir_all(&sandbox);
}
