use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use handout_desk::config::load_config;
use handout_desk::db;
use handout_desk::projects::NewProject;
use handout_desk::queue::TaskQueue;
use handout_desk::server::AppState;
use handout_desk_core::models::{NewHandout, NewSection};

fn hdk_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("hdk");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/hdk.sqlite"

[server]
bind = "127.0.0.1:7341"

[auth]
secret = "integration-secret"

[mail]
transport = "outbox"
outbox_dir = "{root}/data/outbox"
default_language = "en"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("hdk.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_hdk(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = hdk_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run hdk binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_hdk(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/hdk.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_hdk(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_hdk(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_account_create_and_usage() {
    let (_tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);

    let (stdout, stderr, success) = run_hdk(
        &config_path,
        &[
            "account",
            "create",
            "--username",
            "alice",
            "--email",
            "alice@example.com",
            "--password",
            "correct-horse",
            "--tier",
            "pro",
        ],
    );
    assert!(success, "account create failed: {}", stderr);
    assert!(stdout.contains("Created account alice"));
    assert!(stdout.contains("pro"));

    let (stdout, stderr, success) = run_hdk(&config_path, &["usage", "alice"]);
    assert!(success, "usage failed: {}", stderr);
    assert!(stdout.contains("Stored:     0 bytes"));
    assert!(stdout.contains("Limit:      2147483648 bytes"));
}

#[test]
fn test_account_duplicate_username_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);

    let args = [
        "account",
        "create",
        "--username",
        "bob",
        "--email",
        "bob@example.com",
        "--password",
        "long-enough",
    ];
    let (_, _, first) = run_hdk(&config_path, &args);
    assert!(first);
    let (_, _, second) = run_hdk(&config_path, &args);
    assert!(!second, "duplicate account should fail");
}

#[test]
fn test_set_tier() {
    let (_tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);
    run_hdk(
        &config_path,
        &[
            "account",
            "create",
            "--username",
            "carol",
            "--email",
            "carol@example.com",
            "--password",
            "long-enough",
        ],
    );

    let (stdout, stderr, success) =
        run_hdk(&config_path, &["account", "set-tier", "carol", "enterprise"]);
    assert!(success, "set-tier failed: {}", stderr);
    assert!(stdout.contains("enterprise"));

    let (_, _, success) = run_hdk(&config_path, &["account", "set-tier", "carol", "gold"]);
    assert!(!success, "unknown tier should be rejected by the parser");
}

#[test]
fn test_usage_unknown_account_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);

    let (_, stderr, success) = run_hdk(&config_path, &["usage", "nobody"]);
    assert!(!success);
    assert!(stderr.contains("not found"));
}

#[test]
fn test_template_add() {
    let (tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);

    let html = tmp.path().join("verify.html");
    fs::write(&html, "<p>สวัสดี {{ username }}</p>").unwrap();

    let (stdout, stderr, success) = run_hdk(
        &config_path,
        &[
            "template",
            "add",
            "--name",
            "email_verification",
            "--language",
            "th",
            "--subject",
            "ยืนยันอีเมล",
            "--html",
            html.to_str().unwrap(),
        ],
    );
    assert!(success, "template add failed: {}", stderr);
    assert!(stdout.contains("email_verification (th)"));
}

#[test]
fn test_outline_unknown_handout_fails() {
    let (_tmp, config_path) = setup_test_env();
    run_hdk(&config_path, &["init"]);

    let (_, stderr, success) = run_hdk(&config_path, &["outline", "missing-id"]);
    assert!(!success);
    assert!(stderr.contains("Handout not found"));
}

#[test]
fn test_missing_secret_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("hdk.toml");
    fs::write(
        &config_path,
        format!(
            "[db]\npath = \"{}/hdk.sqlite\"\n\n[server]\nbind = \"127.0.0.1:7342\"\n\n[auth]\nsecret = \"\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_hdk(&config_path, &["init"]);
    assert!(!success);
    assert!(stderr.contains("auth.secret"));
}

#[test]
fn test_completions_need_no_config() {
    let (stdout, _, success) = run_hdk(Path::new("/nonexistent/hdk.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("hdk"));
}

#[tokio::test]
async fn test_outline_and_export_pdf() {
    let (tmp, config_path) = setup_test_env();
    let (_, _, success) = run_hdk(&config_path, &["init"]);
    assert!(success);

    let cfg = load_config(&config_path).unwrap();
    let pool = db::connect(&cfg).await.unwrap();
    let (queue, _rx) = TaskQueue::channel();
    let state = AppState::build(&cfg, pool.clone(), queue);

    let account = state
        .accounts
        .create_account(
            "dave",
            "dave@example.com",
            "long-enough",
            handout_desk_core::models::Role::Editor,
            handout_desk_core::quota::Tier::Pro,
        )
        .await
        .unwrap();
    let project = state
        .projects
        .create(
            &account.id,
            NewProject {
                name: "Physics".into(),
                description: String::new(),
                tag_ids: Vec::new(),
            },
        )
        .await
        .unwrap();
    let handout = state
        .content
        .create_handout(
            &account.id,
            NewHandout {
                project_id: project.id.clone(),
                folder_id: None,
                title: "Kinematics".into(),
                subtitle: "Week 1".into(),
                description: String::new(),
                style: None,
                is_published: false,
            },
        )
        .await
        .unwrap();
    let top = state
        .content
        .create_section(
            &account.id,
            NewSection {
                handout_id: handout.id.clone(),
                parent_id: None,
                title: "Velocity".into(),
                content: "Speed with a direction, $v = dx/dt$.".into(),
                order: None,
            },
        )
        .await
        .unwrap();
    state
        .content
        .create_section(
            &account.id,
            NewSection {
                handout_id: handout.id.clone(),
                parent_id: Some(top.id.clone()),
                title: "Average velocity".into(),
                content: "Displacement over time.".into(),
                order: None,
            },
        )
        .await
        .unwrap();
    pool.close().await;

    let (stdout, stderr, success) = run_hdk(&config_path, &["outline", &handout.id]);
    assert!(success, "outline failed: {}", stderr);
    assert!(stdout.contains("Kinematics"));
    let velocity = stdout.find("Velocity").unwrap();
    let average = stdout.find("Average velocity").unwrap();
    assert!(velocity < average);

    let output = tmp.path().join("kinematics.pdf");
    let (stdout, stderr, success) = run_hdk(
        &config_path,
        &["export", &handout.id, "--output", output.to_str().unwrap()],
    );
    assert!(success, "export failed: {}", stderr);
    assert!(stdout.contains("Wrote"));
    let bytes = fs::read(&output).unwrap();
    assert!(bytes.starts_with(b"%PDF"));

    // The exported size now counts toward usage.
    let (stdout, _, _) = run_hdk(&config_path, &["usage", "dave"]);
    let expected = format!("{} document", bytes.len());
    assert!(stdout.contains(&expected), "usage output: {}", stdout);

    let html_out = tmp.path().join("kinematics.html");
    let (_, stderr, success) = run_hdk(
        &config_path,
        &[
            "export",
            &handout.id,
            "--output",
            html_out.to_str().unwrap(),
            "--format",
            "html",
        ],
    );
    assert!(success, "html export failed: {}", stderr);
    let html = fs::read_to_string(&html_out).unwrap();
    assert!(html.contains("id=\"section-"));
    assert!(html.contains("latex.codecogs.com"));
}
