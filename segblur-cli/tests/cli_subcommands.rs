use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir = std::env::temp_dir().join(format!(
        "segblur_cli_{label}_{}_{}",
        std::process::id(),
        nanos
    ));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn write_png(path: &Path, w: u32, h: u32) {
    image::RgbImage::from_fn(w, h, |x, y| image::Rgb([(x * 9) as u8, (y * 7) as u8, 128]))
        .save(path)
        .expect("write png");
}

fn segblur(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_segblur"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("run segblur")
}

fn stdout_json(output: &Output) -> serde_json::Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
        panic!(
            "stdout is not one JSON object ({e}): {stdout}\nstderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

#[test]
fn help_lists_subcommands() {
    let output = segblur(&["help"]);
    assert!(
        output.status.success(),
        "segblur help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    for sub in ["segment", "classes", "probe"] {
        assert!(stdout.contains(sub), "missing {sub} in help output");
    }
}

#[test]
fn segment_help_lists_pipeline_flags() {
    let output = segblur(&["segment", "--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in [
        "--input",
        "--output-dir",
        "--class",
        "--batch-size",
        "--target-width",
        "--target-height",
        "--device",
        "--backend",
        "--log-level",
        "--dry-run",
    ] {
        assert!(stdout.contains(flag), "missing {flag} in segment help");
    }
}

#[test]
fn classes_json_lists_pascal_voc() {
    let output = segblur(&["classes", "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    let classes = value["classes"].as_array().expect("classes array");
    assert_eq!(classes.len(), 21);
    assert_eq!(classes[0]["name"], "__background__");
    assert_eq!(classes[15]["name"], "person");
    assert_eq!(classes[15]["index"], 15);
}

#[test]
fn classes_reads_custom_labels() {
    let dir = unique_temp_dir("labels");
    let labels = dir.join("labels.txt");
    fs::write(&labels, "# custom\nbackground\nskin\n\nhair\n").unwrap();
    let output = segblur(&["classes", "--labels", labels.to_str().unwrap()]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("  1  skin"), "{stdout}");
    assert!(stdout.contains("  2  hair"), "{stdout}");
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn unknown_backend_exits_with_configuration_code() {
    let dir = unique_temp_dir("backend");
    let output = segblur(&[
        "segment",
        "--input",
        dir.to_str().unwrap(),
        "--backend",
        "unknown",
    ]);
    assert_eq!(output.status.code(), Some(10));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown"), "{stderr}");
    assert!(
        !stderr.contains("Execution context acquired"),
        "device context must not be acquired: {stderr}"
    );
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn missing_input_exits_with_source_open_code() {
    let output = segblur(&["segment", "--input", "/no/such/input.mp4", "--json"]);
    assert_eq!(output.status.code(), Some(20));
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["ok"], false);
    assert_eq!(value["command"], "segment");
    assert_eq!(value["code"], 20);
}

#[test]
fn unknown_class_exits_with_configuration_code() {
    let dir = unique_temp_dir("class");
    let output = segblur(&[
        "segment",
        "--input",
        dir.to_str().unwrap(),
        "--class",
        "unicorn",
        "--dry-run",
    ]);
    assert_eq!(output.status.code(), Some(10));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn dry_run_json_resolves_plan_from_config_and_flags() {
    let dir = unique_temp_dir("dry");
    write_png(&dir.join("a.png"), 16, 12);
    let config = dir.join("run.json");
    fs::write(
        &config,
        format!(
            r#"{{ "input": {:?}, "batch_size": 3, "backend": "pytorch", "class_name": "cat" }}"#,
            dir.join("a.png").to_str().unwrap()
        ),
    )
    .unwrap();

    let output = segblur(&[
        "segment",
        "--config",
        config.to_str().unwrap(),
        "--class",
        "person",
        "--dry-run",
        "--json",
    ]);
    assert!(
        output.status.success(),
        "dry run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["dry_run"], true);
    assert_eq!(value["modality"], "images");
    assert_eq!(value["backend"], "interpreted");
    assert_eq!(value["class"], "person");
    assert_eq!(value["class_index"], 15);
    assert_eq!(value["batch_size"], 3);
    assert_eq!(value["target"]["width"], 224);
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn invalid_config_key_is_rejected() {
    let dir = unique_temp_dir("badcfg");
    let config = dir.join("run.json");
    fs::write(&config, r#"{ "batchsize": 3 }"#).unwrap();
    let output = segblur(&["segment", "--config", config.to_str().unwrap(), "--dry-run"]);
    assert_eq!(output.status.code(), Some(10));
    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn probe_reports_image_collection() {
    let dir = unique_temp_dir("probe");
    write_png(&dir.join("x.png"), 8, 8);
    write_png(&dir.join("y.png"), 8, 8);
    let output = segblur(&["probe", "--input", dir.to_str().unwrap(), "--json"]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_schema_version(&value);
    assert_eq!(value["modality"], "images");
    assert_eq!(value["images"], 2);
    assert!(value.get("video").is_none());
    let _ = fs::remove_dir_all(&dir);
}

#[test]
#[ignore = "requires ONNX Runtime, a segmentation model in SEGBLUR_TEST_MODEL, and a GPU"]
fn segment_writes_one_output_per_image() {
    let Some(model) = std::env::var_os("SEGBLUR_TEST_MODEL") else {
        return;
    };
    let input = unique_temp_dir("run_in");
    let output_dir = unique_temp_dir("run_out");
    write_png(&input.join("a.png"), 64, 48);
    write_png(&input.join("b.png"), 64, 48);
    let output = segblur(&[
        "segment",
        "--input",
        input.to_str().unwrap(),
        "--output-dir",
        output_dir.to_str().unwrap(),
        "--model",
        model.to_str().unwrap(),
        "--class",
        "person",
        "--json",
    ]);
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["frames"], 2);
    assert!(output_dir.join("out_a.png").exists());
    assert!(output_dir.join("out_b.png").exists());
    let _ = fs::remove_dir_all(&input);
    let _ = fs::remove_dir_all(&output_dir);
}
