//! Integration tests for `tibok-ext`, run against a file-backed catalog.

use assert_cmd::Command;
use flate2::Compression;
use flate2::write::GzEncoder;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tibok_core::plugins::package::sha256_hex;

/// An isolated home with a config file pointing at a local catalog.
struct Sandbox {
    temp_dir: TempDir,
}

impl Sandbox {
    fn new() -> Self {
        let sandbox = Self { temp_dir: TempDir::new().unwrap() };
        let root = sandbox.root().display().to_string();
        let config = format!(
            "plugins_dir = \"{root}/plugins\"\n\
             builtin_dir = \"{root}/builtin\"\n\
             state_file = \"{root}/plugin-state.json\"\n\
             trusted_keys_dir = \"{root}/trusted-keys\"\n\
             registry_url = \"file://{root}/catalog.json\"\n"
        );
        fs::write(sandbox.config_path(), config).unwrap();
        sandbox.write_catalog(&[]);
        sandbox
    }

    fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    fn config_path(&self) -> PathBuf {
        self.root().join("plugins.toml")
    }

    fn plugins_dir(&self) -> PathBuf {
        self.root().join("plugins")
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("tibok-ext").unwrap();
        cmd.env("HOME", self.root())
            .env("NO_COLOR", "1")
            .env_remove("TIBOK_PLUGINS_DIR")
            .env_remove("TIBOK_BUILTIN_PLUGINS_DIR")
            .env_remove("TIBOK_REGISTRY_URL")
            .env_remove("TIBOK_HOST_VERSION")
            .arg("--config")
            .arg(self.config_path());
        cmd
    }

    fn write_catalog(&self, entries: &[serde_json::Value]) {
        let catalog = serde_json::json!({ "categories": ["writing", "export"], "extensions": entries });
        fs::write(self.root().join("catalog.json"), catalog.to_string()).unwrap();
    }

    /// Writes a package and returns a catalog entry for it.
    fn publish(&self, id: &str, version: &str, capabilities: &[&str]) -> serde_json::Value {
        let bytes = package_bytes(&manifest(id, version, capabilities));
        let path = self.root().join(format!("{id}-{version}.tar.gz"));
        fs::write(&path, &bytes).unwrap();
        serde_json::json!({
            "id": id,
            "name": format!("{id} plugin"),
            "version": version,
            "description": "Counts words in the open document",
            "capabilities": capabilities,
            "categories": ["writing"],
            "downloadUrl": format!("file://{}", path.display()),
            "sha256": sha256_hex(&bytes),
        })
    }

    fn sideload(&self, dir: &Path, id: &str, capabilities: &[&str]) {
        let plugin_dir = dir.join(id);
        fs::create_dir_all(&plugin_dir).unwrap();
        fs::write(plugin_dir.join("tibok-plugin.json"), manifest(id, "1.0.0", capabilities)).unwrap();
    }
}

fn manifest(id: &str, version: &str, capabilities: &[&str]) -> String {
    serde_json::json!({
        "id": id,
        "name": format!("{id} plugin"),
        "version": version,
        "minHostVersion": "0.1",
        "kind": "script",
        "capabilities": capabilities,
    })
    .to_string()
}

fn package_bytes(manifest: &str) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in [("package/tibok-plugin.json", manifest), ("package/main.lua", "return {}")] {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, content.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

fn list_json(sandbox: &Sandbox) -> serde_json::Value {
    let output = sandbox.cmd().args(["list", "--json"]).output().unwrap();
    assert!(output.status.success());
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_list_no_plugins() {
    let sandbox = Sandbox::new();
    sandbox
        .cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No plugins installed"));
}

#[test]
fn test_list_reports_broken_plugins() {
    let sandbox = Sandbox::new();
    sandbox.sideload(&sandbox.plugins_dir(), "com.example.good", &[]);
    let broken = sandbox.plugins_dir().join("broken");
    fs::create_dir_all(&broken).unwrap();
    fs::write(broken.join("tibok-plugin.json"), "{ not json").unwrap();

    sandbox
        .cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.good"))
        .stdout(predicate::str::contains("Failed to load (1)"));

    let listing = list_json(&sandbox);
    assert_eq!(listing["plugins"][0]["state"], "discovered");
    assert_eq!(listing["failures"][0]["key"], "broken");
}

#[test]
fn test_search_and_info() {
    let sandbox = Sandbox::new();
    sandbox.write_catalog(&[
        sandbox.publish("com.example.wordcount", "1.0.0", &["document-read"]),
        sandbox.publish("com.example.sync", "2.0.0", &["network"]),
    ]);

    sandbox
        .cmd()
        .args(["search", "wordcount"])
        .assert()
        .success()
        .stdout(predicate::str::contains("com.example.wordcount"))
        .stdout(predicate::str::contains("com.example.sync").not());

    let output = sandbox.cmd().args(["search", "--json"]).output().unwrap();
    let results: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(results.as_array().unwrap().len(), 2);

    sandbox
        .cmd()
        .args(["info", "com.example.sync"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Network access"))
        .stdout(predicate::str::contains("high"));

    sandbox.cmd().args(["info", "com.example.missing"]).assert().failure();
}

#[test]
fn test_search_rejects_unknown_tier() {
    let sandbox = Sandbox::new();
    sandbox.cmd().args(["search", "--tier", "gold"]).assert().failure();
}

#[test]
fn test_install_without_terminal_is_denied() {
    let sandbox = Sandbox::new();
    sandbox.write_catalog(&[sandbox.publish("com.example.sync", "1.0.0", &["network"])]);

    sandbox
        .cmd()
        .args(["install", "com.example.sync"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("pass --yes"));

    assert!(!sandbox.plugins_dir().join("com.example.sync").exists());
}

#[test]
fn test_install_with_yes_then_uninstall() {
    let sandbox = Sandbox::new();
    sandbox.write_catalog(&[sandbox.publish("com.example.sync", "1.0.0", &["network"])]);

    sandbox
        .cmd()
        .args(["install", "com.example.sync", "--yes"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Installed com.example.sync 1.0.0"));
    assert!(sandbox.plugins_dir().join("com.example.sync").join("main.lua").exists());

    let listing = list_json(&sandbox);
    assert_eq!(listing["plugins"][0]["state"], "enabled");
    assert_eq!(listing["plugins"][0]["functional"], true);

    sandbox.cmd().args(["install", "com.example.sync", "--yes"]).assert().failure();

    sandbox.cmd().args(["uninstall", "com.example.sync"]).assert().success();
    assert!(!sandbox.plugins_dir().join("com.example.sync").exists());
    assert!(list_json(&sandbox)["plugins"].as_array().unwrap().is_empty());
}

#[test]
fn test_install_rejects_tampered_package() {
    let sandbox = Sandbox::new();
    let mut entry = sandbox.publish("com.example.wordcount", "1.0.0", &[]);
    entry["sha256"] = serde_json::json!("0".repeat(64));
    sandbox.write_catalog(&[entry]);

    sandbox
        .cmd()
        .args(["install", "com.example.wordcount"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("verification failed"));
    assert!(!sandbox.plugins_dir().join("com.example.wordcount").exists());
}

#[test]
fn test_outdated_and_update() {
    let sandbox = Sandbox::new();
    sandbox.write_catalog(&[sandbox.publish("com.example.wordcount", "1.0.0", &[])]);
    sandbox.cmd().args(["install", "com.example.wordcount"]).assert().success();

    sandbox
        .cmd()
        .args(["update", "com.example.wordcount"])
        .assert()
        .success()
        .stdout(predicate::str::contains("up to date"));

    sandbox.write_catalog(&[sandbox.publish("com.example.wordcount", "1.1.0", &[])]);
    sandbox
        .cmd()
        .arg("outdated")
        .assert()
        .success()
        .stdout(predicate::str::contains("1.1.0"));

    sandbox
        .cmd()
        .args(["update", "com.example.wordcount"])
        .assert()
        .success()
        .stdout(predicate::str::contains("1.0.0 → 1.1.0"));

    sandbox
        .cmd()
        .arg("outdated")
        .assert()
        .success()
        .stdout(predicate::str::contains("All plugins are up to date"));
}

#[test]
fn test_builtin_cannot_be_uninstalled() {
    let sandbox = Sandbox::new();
    sandbox.sideload(&sandbox.root().join("builtin"), "com.tibok.markdown", &["commands"]);

    sandbox
        .cmd()
        .args(["uninstall", "com.tibok.markdown"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("cannot be removed"));

    sandbox.cmd().args(["disable", "com.tibok.markdown"]).assert().success();
    assert_eq!(list_json(&sandbox)["plugins"][0]["state"], "disabled");
}

#[test]
fn test_enable_and_disable_sideloaded_plugin() {
    let sandbox = Sandbox::new();
    sandbox.sideload(&sandbox.plugins_dir(), "com.example.local", &[]);

    sandbox.cmd().args(["enable", "com.example.local"]).assert().success();
    assert_eq!(list_json(&sandbox)["plugins"][0]["state"], "enabled");

    sandbox.cmd().args(["disable", "com.example.local"]).assert().success();
    assert_eq!(list_json(&sandbox)["plugins"][0]["state"], "disabled");

    sandbox.cmd().args(["enable", "com.example.missing"]).assert().failure();
}

#[test]
fn test_enable_high_risk_sideload_requires_consent() {
    let sandbox = Sandbox::new();
    sandbox.sideload(&sandbox.plugins_dir(), "com.example.shell", &["process"]);

    sandbox.cmd().args(["enable", "com.example.shell"]).assert().failure();
    assert_eq!(list_json(&sandbox)["plugins"][0]["state"], "discovered");

    sandbox.cmd().args(["enable", "com.example.shell", "--yes"]).assert().success();
    assert_eq!(list_json(&sandbox)["plugins"][0]["state"], "enabled");
}

#[test]
fn test_keygen_and_sign() {
    let sandbox = Sandbox::new();
    let keys = sandbox.root().join("keys");

    sandbox
        .cmd()
        .args(["keygen", "--name", "release", "--out"])
        .arg(&keys)
        .assert()
        .success();
    assert!(keys.join("release.key").exists());
    assert!(keys.join("release.pub").exists());

    sandbox.cmd().args(["keygen", "--name", "release", "--out"]).arg(&keys).assert().failure();

    let package = sandbox.root().join("package.tar.gz");
    let bytes = package_bytes(&manifest("com.example.signed", "1.0.0", &[]));
    fs::write(&package, &bytes).unwrap();

    sandbox
        .cmd()
        .arg("sign")
        .arg(&package)
        .arg("--key")
        .arg(keys.join("release.key"))
        .assert()
        .success()
        .stdout(predicate::str::contains(sha256_hex(&bytes)))
        .stdout(predicate::str::contains("signature: "));
}
