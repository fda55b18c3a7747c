use std::path::Path;
use std::process::Command;

use npc_harness::dataset::{Dataset, LabeledSample};
use npc_harness::hierarchy::PerLayer;
use tempfile::tempdir;

fn write_dataset(path: &Path) {
    let groups = [
        ("Alkaloids", "Indole alkaloids", "Carbazoles", 12),
        ("Alkaloids", "Indole alkaloids", "Simple indoles", 12),
        ("Terpenoids", "Monoterpenoids", "Iridoids", 12),
        ("Terpenoids", "Sesquiterpenoids", "Drimanes", 12),
    ];
    let mut samples = Vec::new();
    for (idx, (p, s, c, n)) in groups.into_iter().enumerate() {
        for k in 0..n {
            let mut good = vec![0.0; groups.len()];
            good[idx] = 1.0;
            good.push(k as f64 * 0.005);
            let noise = vec![(k % 3) as f64, ((k + idx) % 2) as f64];
            samples.push(
                LabeledSample::new(
                    format!("npc{:04}", samples.len()),
                    PerLayer::new(vec![p.to_string()], vec![s.to_string()], vec![c.to_string()]),
                )
                .with_feature("good", good)
                .with_feature("maccs", noise),
            );
        }
    }
    let dataset = Dataset::new("smoke", samples);
    std::fs::write(path, serde_json::to_string_pretty(&dataset).unwrap()).unwrap();
}

#[test]
fn cli_dag_coverage_csv() {
    let dir = tempdir().unwrap();
    let dataset = dir.path().join("dataset.json");
    let out = dir.path().join("coverage.csv");
    write_dataset(&dataset);

    let status = Command::new(env!("CARGO_BIN_EXE_npc"))
        .args(["dag-coverage", "--format", "csv"])
        .arg("--dataset")
        .arg(&dataset)
        .arg("--out")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let raw = std::fs::read_to_string(&out).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines[0], "layer,observed,total,coverage");
    // a derived hierarchy is covered completely by its own dataset
    assert!(lines.contains(&"DAG,4,4,1.000000"), "{raw}");
    assert!(lines.contains(&"classes,4,4,1.000000"), "{raw}");
}

#[test]
fn cli_feature_sets_evaluation_writes_tables() {
    let dir = tempdir().unwrap();
    let dataset = dir.path().join("dataset.json");
    let performance = dir.path().join("performance.csv");
    let training = dir.path().join("training");
    let barplots = dir.path().join("barplots");
    let trace = dir.path().join("units.jsonl");
    write_dataset(&dataset);

    let status = Command::new(env!("CARGO_BIN_EXE_npc"))
        .args([
            "feature-sets-evaluation",
            "--include-maccs",
            "--include-feature",
            "good",
            "--holdouts",
            "2",
            "--validation-size",
            "0.25",
            "--seed",
            "5",
        ])
        .arg("--dataset")
        .arg(&dataset)
        .arg("--performance-path")
        .arg(&performance)
        .arg("--training-directory")
        .arg(&training)
        .arg("--barplot-directory")
        .arg(&barplots)
        .arg("--trace")
        .arg(&trace)
        .status()
        .unwrap();
    assert!(status.success());

    let raw = std::fs::read_to_string(&performance).unwrap();
    let mut lines = raw.lines();
    assert_eq!(
        lines.next(),
        Some("feature_set,stage,layer,class,metric,mean,std,ci95,holdouts")
    );
    assert!(raw.contains("good,validation,classes,Carbazoles,precision,"));
    assert!(raw.contains("good,test,"));
    assert!(raw.contains("maccs,validation,"));

    for name in ["hierarchy.json", "split.json", "holdouts.json", "report.md", "run.json"] {
        assert!(training.join(name).exists(), "missing {name}");
    }
    let barplot_count = std::fs::read_dir(&barplots).unwrap().count();
    assert!(barplot_count > 0);

    let units = std::fs::read_to_string(&trace).unwrap();
    // 2 feature sets x 2 holdouts, then one test unit each
    assert_eq!(units.lines().count(), 6);
}

#[test]
fn cli_feature_sets_evaluation_without_selection_fails() {
    let dir = tempdir().unwrap();
    let dataset = dir.path().join("dataset.json");
    write_dataset(&dataset);

    let output = Command::new(env!("CARGO_BIN_EXE_npc"))
        .arg("feature-sets-evaluation")
        .arg("--dataset")
        .arg(&dataset)
        .arg("--training-directory")
        .arg(dir.path().join("training"))
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no feature sets selected"));
}

#[test]
fn cli_visualize_writes_distributions() {
    let dir = tempdir().unwrap();
    let dataset = dir.path().join("dataset.json");
    let out = dir.path().join("plots");
    write_dataset(&dataset);

    let status = Command::new(env!("CARGO_BIN_EXE_npc"))
        .arg("visualize")
        .arg("--dataset")
        .arg(&dataset)
        .arg("--output-directory")
        .arg(&out)
        .status()
        .unwrap();
    assert!(status.success());

    let manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(out.join("manifest.json")).unwrap())
            .unwrap();
    assert_eq!(manifest["samples"], 48);
    assert_eq!(manifest["tables"].as_array().unwrap().len(), 3);

    let classes = std::fs::read_to_string(out.join("classes_distribution.csv")).unwrap();
    assert_eq!(classes.lines().next(), Some("label,samples"));
    assert_eq!(classes.lines().count(), 5);
}
