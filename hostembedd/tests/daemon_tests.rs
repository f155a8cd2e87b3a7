use serde_json::Value;
use std::io::Write;
use std::process::{Command, Stdio};

/// Feeds `lines` to a fresh daemon and returns its stdout lines.
fn run_daemon(args: &[&str], lines: &[&str]) -> Vec<String> {
    let bin_path = env!("CARGO_BIN_EXE_hostembedd");
    let mut child = Command::new(bin_path)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn daemon");

    {
        let stdin = child.stdin.as_mut().expect("stdin");
        for line in lines {
            writeln!(stdin, "{}", line).expect("write request");
        }
    }
    drop(child.stdin.take());

    let output = child.wait_with_output().expect("daemon output");
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::to_string)
        .collect()
}

fn ok_body(line: &str) -> Value {
    let json = line
        .strip_prefix("OK ")
        .unwrap_or_else(|| panic!("expected OK line, got: {}", line));
    serde_json::from_str(json).unwrap()
}

fn error_body(line: &str) -> Value {
    let json = line
        .strip_prefix("ERROR ")
        .unwrap_or_else(|| panic!("expected ERROR line, got: {}", line));
    serde_json::from_str(json).unwrap()
}

const REGISTER: &str = r#"{"type":"register","name":"emb","shape":[8,2],"optimizer":{"kind":"SGD","learning_rate":0.5},"initializer":{"kind":"values","values":[0,0,1,1,2,2,3,3,4,4,5,5,6,6,7,7]}}"#;

#[test]
fn test_register_lookup_accumulate() {
    let out = run_daemon(
        &[],
        &[
            REGISTER,
            r#"{"type":"lookup","name":"emb","ids":[0,5,7]}"#,
            r#"{"type":"accumulate","name":"emb","ids":[5,5],"grads":[[1,2],[1,2]]}"#,
            r#"{"type":"lookup","name":"emb","ids":[5]}"#,
            r#"{"type":"shutdown"}"#,
        ],
    );

    assert_eq!(out.len(), 5, "{:?}", out);

    let registered = ok_body(&out[0]);
    assert_eq!(registered["type"], "register");
    assert_eq!(registered["table"]["partition_strategy"], "TOKEN");
    assert_eq!(registered["table"]["dtype"], "f32");

    let first = ok_body(&out[1]);
    assert_eq!(first["shape"], serde_json::json!([3, 2]));
    assert_eq!(first["values"], serde_json::json!([0.0, 0.0, 5.0, 5.0, 7.0, 7.0]));

    let accumulated = ok_body(&out[2]);
    assert_eq!(accumulated["rows_updated"], 2);
    assert_ne!(accumulated["sha256"], first["sha256"]);

    // 5 - 0.5 * (1 + 1), 5 - 0.5 * (2 + 2)
    let second = ok_body(&out[3]);
    assert_eq!(second["values"], serde_json::json!([4.0, 3.0]));
    assert_eq!(second["sha256"], accumulated["sha256"]);

    assert_eq!(ok_body(&out[4])["type"], "shutdown");
}

#[test]
fn test_errors_use_diagnostic_codes() {
    let out = run_daemon(
        &[],
        &[
            r#"{"type":"lookup","name":"missing","ids":[0]}"#,
            r#"{"type":"register","name":"bad","shape":[4,2],"dtype":"bool"}"#,
            r#"{"type":"register","name":"opt","shape":[4,2],"optimizer":{"kind":"adam","learning_rate":0.1}}"#,
            REGISTER,
            r#"{"type":"register","name":"emb","shape":[8,3]}"#,
            r#"{"type":"lookup","name":"emb","ids":[8],"clip_indices":false}"#,
            r#"{"type":"accumulate","name":"emb","ids":[0],"grads":[[1,2,3]]}"#,
            r#"{"type":"register","name":"huge","shape":[8589934592,8589934592]}"#,
            "not json",
            r#"{"type":"lookup","name":"emb","ids":[2]}"#,
        ],
    );

    let codes: Vec<String> = out
        .iter()
        .filter(|line| line.starts_with("ERROR "))
        .map(|line| error_body(line)["code"].as_str().unwrap_or("").to_string())
        .collect();
    assert_eq!(
        codes,
        vec![
            "E_NOT_FOUND",
            "E_DTYPE",
            "E_UNSUPPORTED_OPTIMIZER",
            "E_CONFLICT",
            "E_INDEX_OUT_OF_RANGE",
            "E_SHAPE",
            "E_SHAPE",
            "E_PARSE",
        ]
    );
    // the daemon keeps serving after every error
    assert_eq!(ok_body(out.last().unwrap())["values"], serde_json::json!([2.0, 2.0]));
}

#[test]
fn test_clipping_follows_request_and_config() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("device.json");
    std::fs::write(&config, r#"{"clip_indices": false, "replicas": 2}"#).unwrap();

    let out = run_daemon(
        &["--config", config.to_str().unwrap()],
        &[
            REGISTER,
            r#"{"type":"lookup","name":"emb","ids":[9]}"#,
            r#"{"type":"lookup","name":"emb","ids":[9],"clip_indices":true}"#,
        ],
    );

    assert_eq!(error_body(&out[1])["code"], "E_INDEX_OUT_OF_RANGE");
    assert_eq!(ok_body(&out[2])["values"], serde_json::json!([7.0, 7.0]));
}

#[test]
fn test_nested_id_batches_and_describe() {
    let out = run_daemon(
        &[],
        &[
            REGISTER,
            r#"{"type":"register","name":"other","shape":[4,4],"partition_strategy":"encoding"}"#,
            r#"{"type":"lookup","name":"emb","ids":[1,2,3,4],"shape":[2,2]}"#,
            r#"{"type":"describe"}"#,
            r#"{"type":"describe","name":"other"}"#,
        ],
    );

    assert_eq!(ok_body(&out[2])["shape"], serde_json::json!([2, 2, 2]));

    let all = ok_body(&out[3]);
    let names: Vec<&str> = all["tables"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["emb", "other"]);

    let one = ok_body(&out[4]);
    assert_eq!(one["tables"][0]["partition_strategy"], "ENCODING");
    assert_eq!(one["tables"][0]["optimizer"], Value::Null);
}

#[test]
fn test_save_and_restore() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("ckpt");
    let save = format!(r#"{{"type":"save","dir":"{}"}}"#, ckpt.display());

    let out = run_daemon(
        &[],
        &[
            REGISTER,
            r#"{"type":"accumulate","name":"emb","ids":[1],"grads":[[2,2]]}"#,
            &save,
        ],
    );
    let saved = ok_body(&out[2]);
    assert_eq!(saved["tables"], 1);

    let restored = run_daemon(
        &["--restore", ckpt.to_str().unwrap()],
        &[r#"{"type":"lookup","name":"emb","ids":[1]}"#],
    );
    // 1 - 0.5 * 2
    assert_eq!(ok_body(&restored[0])["values"], serde_json::json!([0.0, 0.0]));
}
