//! The `avivo` binary run against a temporary config with embeddings off.

use std::fs;
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;
use tempfile::TempDir;

fn avivo_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("avivo");
    path
}

fn find_free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Config with embeddings switched off, so no command reaches a model server.
fn setup_test_env() -> (TempDir, PathBuf) {
    let port = find_free_port();
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(files_dir.join("notes.txt"), "Some notes about deployment.").unwrap();
    fs::write(files_dir.join("tool.exe"), [0x4d, 0x5a, 0x90]).unwrap();

    let config_content = format!(
        r#"[index]
path = "{}/data/index"

[chunking]
chunk_size = 300
chunk_overlap = 30

[retrieval]
top_k = 3

[embedding]
provider = "disabled"

[generation]
model = "test-llm"

[server]
bind = "127.0.0.1:{}"
"#,
        root.display(),
        port
    );
    let config_path = config_dir.join("avivo.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_avivo(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = avivo_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run avivo binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_stats_reports_configuration() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_avivo(&config, &["stats"]);
    assert!(success, "stats failed: {}", stderr);

    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["llm_model"], "test-llm");
    assert_eq!(stats["top_k"], 3);
    assert_eq!(stats["vector_store"]["total_documents"], 0);
    assert_eq!(stats["vector_store"]["chunk_size"], 300);
}

#[test]
fn test_query_on_empty_knowledge_base() {
    let (_tmp, config) = setup_test_env();
    let (stdout, stderr, success) = run_avivo(&config, &["query", "What is deployed?"]);
    assert!(success, "query failed: {}", stderr);
    assert!(stdout.contains("upload relevant documents first"));
}

#[test]
fn test_ingest_unsupported_file_fails() {
    let (tmp, config) = setup_test_env();
    let exe = tmp.path().join("files/tool.exe");
    let (_, stderr, success) = run_avivo(&config, &["ingest", exe.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("unsupported"), "stderr: {}", stderr);
}

#[test]
fn test_ingest_without_embeddings_leaves_index_empty() {
    let (tmp, config) = setup_test_env();
    let files = tmp.path().join("files");
    let (stdout, _, success) = run_avivo(&config, &["ingest", files.to_str().unwrap()]);
    assert!(!success);
    // The .exe is skipped when walking a directory; only notes.txt is tried.
    assert!(stdout.contains("Ingested 0 of 1 files."), "stdout: {}", stdout);

    let (stdout, _, _) = run_avivo(&config, &["stats"]);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["vector_store"]["total_documents"], 0);
}

/// `avivo serve` in the background; killed on drop.
struct ServeProcess(Child);

impl ServeProcess {
    fn start(config_path: &Path) -> Self {
        let child = Command::new(avivo_binary())
            .arg("--config")
            .arg(config_path)
            .arg("serve")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();
        Self(child)
    }

    fn wait_ready(&self, port: u16) {
        for _ in 0..50 {
            std::thread::sleep(Duration::from_millis(100));
            if TcpStream::connect(("127.0.0.1", port)).is_ok() {
                return;
            }
        }
        panic!("Server did not become ready within 5 seconds");
    }
}

impl Drop for ServeProcess {
    fn drop(&mut self) {
        let _ = self.0.kill();
        let _ = self.0.wait();
    }
}

fn configured_port(config_path: &Path) -> u16 {
    let text = fs::read_to_string(config_path).unwrap();
    let bind = text
        .lines()
        .find_map(|l| l.strip_prefix("bind = \""))
        .unwrap()
        .trim_end_matches('"');
    bind.rsplit(':').next().unwrap().parse().unwrap()
}

#[test]
fn test_cache_commands_talk_to_running_server() {
    let (_tmp, config) = setup_test_env();
    let server = ServeProcess::start(&config);
    server.wait_ready(configured_port(&config));

    let (stdout, stderr, success) = run_avivo(&config, &["cache", "stats"]);
    assert!(success, "cache stats failed: {}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["enabled"], true);
    assert_eq!(stats["total_keys"], 0);

    let (stdout, stderr, success) = run_avivo(&config, &["cache", "clear", "--type", "rag"]);
    assert!(success, "cache clear failed: {}", stderr);
    assert!(stdout.contains("Cleared rag cache"), "stdout: {}", stdout);
}

#[test]
fn test_cache_clear_rejects_unknown_type() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_avivo(&config, &["cache", "clear", "--type", "everything"]);
    assert!(!success);
    assert!(stderr.contains("everything"), "stderr: {}", stderr);
}

#[test]
fn test_cache_stats_without_server_fails() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_avivo(&config, &["cache", "stats"]);
    assert!(!success);
    assert!(stderr.contains("is `avivo serve` running?"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let missing = tmp.path().join("nope.toml");
    let (stdout, stderr, success) = run_avivo(&missing, &["stats"]);
    assert!(success, "stats failed: {}", stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["llm_model"], "llama3.2");
    assert_eq!(stats["top_k"], 4);
}
