use std::{env, fs, path::Path, path::PathBuf, process::Command};

const CONFIG: &str = "\
[network]
num_nodes = 120
avg_degree = 6.0

[model]
infection_prob = 0.3
recovery_prob = 0.1
death_prob = 0.01
gain_resistance_prob = 0.01
resistance_level = 1.0
resistance_decay = 0.001
mutation_prob = 0.02
genome_bits = 8

[run]
max_steps = 300
infection_threshold = 0.5
num_replicates = 50
seed = 2024

[output]
track_immunity = true
";

fn setup_dir(name: &str, config: &str) -> PathBuf {
    let test_dir = PathBuf::from(env!("CARGO_TARGET_TMPDIR")).join(name);

    fs::remove_dir_all(&test_dir).ok();
    fs::create_dir(&test_dir).expect("failed to create test directory");
    fs::write(test_dir.join("config.toml"), config).expect("failed to write config file");

    test_dir
}

fn run_bin(test_dir: &Path, args: &[&str]) -> std::process::Output {
    let bin = PathBuf::from(env!("CARGO_BIN_EXE_pandemic"));
    let test_dir_str = test_dir
        .to_str()
        .expect("failed to convert test directory to string");

    Command::new(bin)
        .arg("--sim-dir")
        .arg(test_dir_str)
        .args(args)
        .output()
        .expect("failed to execute command")
}

fn run_bin_ok(test_dir: &Path, args: &[&str]) {
    let output = run_bin(test_dir, args);

    let stdout_str =
        std::str::from_utf8(&output.stdout).expect("failed to convert stdout to string");
    let stderr_str =
        std::str::from_utf8(&output.stderr).expect("failed to convert stderr to string");

    assert!(
        output.status.success(),
        "failed to run binary with {args:?}\nstdout:\n{stdout_str}\nstderr:\n{stderr_str}\n"
    );
}

fn read_json(file: PathBuf) -> serde_json::Value {
    let contents = fs::read_to_string(&file).expect("failed to read json file");
    serde_json::from_str(&contents).expect("failed to parse json file")
}

#[test]
fn basic_workflow() {
    let test_dir = setup_dir("basic_workflow", CONFIG);

    run_bin_ok(&test_dir, &["create"]);
    run_bin_ok(&test_dir, &["create"]);

    for run_dir in ["run-0000", "run-0001"] {
        assert!(test_dir.join(run_dir).join("trajectory.msgpack").is_file());
        let outcome = read_json(test_dir.join(run_dir).join("outcome.json"));
        let steps = outcome["termination"]["steps"].as_u64().unwrap();
        assert_eq!(outcome["n_records"].as_u64().unwrap(), steps + 1);
    }

    run_bin_ok(&test_dir, &["analyze"]);

    let analysis = read_json(test_dir.join("run-0000").join("analysis.json"));
    let reports = analysis.as_array().expect("analysis must be a list");
    assert_eq!(reports.len(), 3);
    assert!(reports[1]["peak_infected"]["count"].as_u64().unwrap() >= 1);

    run_bin_ok(&test_dir, &["batch"]);

    let batch = read_json(test_dir.join("batch.json"));
    assert_eq!(batch["n_replicates"], 50);
    let total = ["eradicated", "threshold_reached", "inconclusive", "failed"]
        .iter()
        .map(|key| batch[key].as_u64().unwrap())
        .sum::<u64>();
    assert_eq!(total, 50);

    run_bin_ok(&test_dir, &["clean"]);

    assert!(!test_dir.join("run-0000").exists());
    assert!(!test_dir.join("batch.json").exists());
    assert!(test_dir.join("config.toml").exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn seeded_batches_are_reproducible() {
    let test_dir = setup_dir("seeded_batches_are_reproducible", CONFIG);

    run_bin_ok(&test_dir, &["batch"]);
    let first = read_json(test_dir.join("batch.json"));

    run_bin_ok(&test_dir, &["batch"]);
    let second = read_json(test_dir.join("batch.json"));

    assert_eq!(first["master_seed"], 2024);
    assert_eq!(first["replicates"], second["replicates"]);

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn invalid_config_is_rejected() {
    let config = CONFIG.replace("genome_bits = 8", "genome_bits = 6");
    let test_dir = setup_dir("invalid_config_is_rejected", &config);

    let output = run_bin(&test_dir, &["create"]);
    assert!(!output.status.success());

    let stderr_str = String::from_utf8_lossy(&output.stderr);
    assert!(stderr_str.contains("invalid genome length"), "{stderr_str}");
    assert!(!test_dir.join("run-0000").exists());

    fs::remove_dir_all(&test_dir).ok();
}

#[test]
fn failed_create_leaves_no_run_behind() {
    let test_dir = setup_dir("failed_create_leaves_no_run_behind", CONFIG);

    // A directory in place of the trajectory file makes the run fail.
    let staging_dir = test_dir.join("tmp-run-0000");
    fs::create_dir_all(staging_dir.join("trajectory.msgpack"))
        .expect("failed to create blocking directory");

    let output = run_bin(&test_dir, &["create"]);
    assert!(!output.status.success());
    assert!(!staging_dir.exists());
    assert!(!test_dir.join("run-0000").exists());

    run_bin_ok(&test_dir, &["create"]);
    assert!(test_dir.join("run-0000").join("outcome.json").is_file());

    // A run directory without an outcome does not stop the analysis.
    fs::create_dir(test_dir.join("run-0001")).expect("failed to create empty run dir");
    run_bin_ok(&test_dir, &["create"]);

    run_bin_ok(&test_dir, &["analyze"]);
    assert!(test_dir.join("run-0000").join("analysis.json").is_file());
    assert!(!test_dir.join("run-0001").join("analysis.json").exists());
    assert!(test_dir.join("run-0002").join("analysis.json").is_file());

    fs::remove_dir_all(&test_dir).ok();
}
