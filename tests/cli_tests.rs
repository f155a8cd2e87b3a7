use std::process::Command;

fn run_cli(args: &[&str]) -> (bool, String, String) {
    let bin_path = env!("CARGO_BIN_EXE_hostembed_cli");

    let output = Command::new(bin_path)
        .args(args)
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (output.status.success(), stdout, stderr)
}

#[test]
fn test_serialized_lookup_scenario() {
    let (success, stdout, stderr) = run_cli(&[
        "lookup", "--rows", "8", "--width", "2", "--factor", "2", "--ids", "0,5,7",
    ]);

    assert!(success, "lookup failed\nstdout: {}\nstderr: {}", stdout, stderr);
    assert!(stdout.contains("Output shape: [3, 2]"), "{}", stdout);
    assert!(stdout.contains("0 -> [0, 0]"), "{}", stdout);
    assert!(stdout.contains("5 -> [5, 5]"), "{}", stdout);
    assert!(stdout.contains("7 -> [7, 7]"), "{}", stdout);
    assert!(stdout.contains("✓ LOOKUP OK"));
}

#[test]
fn test_nested_id_batch_shape() {
    let (success, stdout, _) = run_cli(&["lookup", "--ids", "1,2,3,4", "--shape", "2,2"]);

    assert!(success);
    assert!(stdout.contains("Output shape: [2, 2, 2]"), "{}", stdout);
}

#[test]
fn test_divisibility_error_diagnostic() {
    let (success, stdout, stderr) =
        run_cli(&["lookup", "--rows", "10", "--factor", "3", "--ids", "0"]);

    assert!(!success, "lookup should have failed: {}", stdout);
    assert!(stderr.contains("Error [E_DIVISIBILITY]"), "{}", stderr);
    assert!(stderr.contains("rows: 10"), "{}", stderr);
    assert!(stderr.contains("serialization_factor: 3"), "{}", stderr);
    assert!(stderr.contains("hint:"), "{}", stderr);
}

#[test]
fn test_out_of_range_is_clipped_or_rejected() {
    let (success, stdout, _) = run_cli(&["lookup", "--ids", "-1,8"]);
    assert!(success);
    assert!(stdout.contains("-1 -> [0, 0]"), "{}", stdout);
    assert!(stdout.contains("8 -> [7, 7]"), "{}", stdout);

    let (success, _, stderr) = run_cli(&["lookup", "--ids", "8", "--no-clip"]);
    assert!(!success);
    assert!(stderr.contains("E_INDEX_OUT_OF_RANGE"), "{}", stderr);
}

#[test]
fn test_config_chooses_serialization_factor() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("device.json");
    std::fs::write(&config, r#"{"max_shard_rows": 2}"#).unwrap();

    let (success, stdout, stderr) = run_cli(&[
        "--config",
        config.to_str().unwrap(),
        "lookup",
        "--rows",
        "8",
        "--ids",
        "3",
    ]);

    assert!(success, "{}", stderr);
    assert!(stdout.contains("Serialization factor: 4"), "{}", stdout);
}

#[test]
fn test_gradcheck_passes() {
    let (success, stdout, stderr) = run_cli(&["gradcheck"]);
    assert!(success, "gradcheck failed\nstdout: {}\nstderr: {}", stdout, stderr);
    assert!(stdout.contains("✓ GRADCHECK PASSED"));
}

#[test]
fn test_train_reduces_loss_and_checkpoint_inspects() {
    let dir = tempfile::tempdir().unwrap();
    let ckpt = dir.path().join("ckpt");

    let (success, stdout, stderr) = run_cli(&[
        "train",
        "--steps",
        "60",
        "--strategy",
        "encoding",
        "--save",
        ckpt.to_str().unwrap(),
    ]);
    assert!(success, "train failed\nstdout: {}\nstderr: {}", stdout, stderr);

    let losses: Vec<f32> = stdout
        .lines()
        .filter_map(|line| line.split("loss = ").nth(1))
        .filter_map(|v| v.trim().parse().ok())
        .collect();
    assert!(losses.len() >= 2, "{}", stdout);
    assert!(losses.last().unwrap() < losses.first().unwrap(), "{:?}", losses);

    let (success, stdout, stderr) = run_cli(&["inspect", ckpt.to_str().unwrap()]);
    assert!(success, "{}", stderr);
    assert!(stdout.contains("train[16, 4]:f32 ENCODING SGD(lr=2)"), "{}", stdout);
    assert!(stdout.contains("✓ CHECKPOINT OK (1 tables)"));
}

#[test]
fn test_unknown_strategy_is_rejected() {
    let (success, _, stderr) = run_cli(&["train", "--strategy", "diagonal"]);
    assert!(!success);
    assert!(stderr.contains("Error [E_ARGUMENT]"), "{}", stderr);
    assert!(stderr.contains("partition_strategy"), "{}", stderr);
}
