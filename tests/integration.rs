//! Integration tests for the gcardvault command line

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command as AssertCommand;
use mockito::{Matcher, Mock, Server};
use predicates::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

const USER: &str = "me@example.com";
const ADDRESSBOOK_PATH: &str = "/carddav/v1/principals/me@example.com/lists/default/";

/// Isolated configuration and output directories
struct TestEnv {
    temp_dir: TempDir,
    conf_dir: PathBuf,
    output_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let conf_dir = temp_dir.path().join("conf");
        let output_dir = temp_dir.path().join("vault");
        Self {
            temp_dir,
            conf_dir,
            output_dir,
        }
    }

    /// Seed a long-lived token and point every endpoint at `server`.
    fn with_server(server: &Server) -> Self {
        let env = Self::new();
        fs::create_dir_all(&env.conf_dir).unwrap();
        fs::write(
            env.conf_dir.join(format!("{USER}.token.json")),
            r#"{"token": "test-token", "refresh_token": "r", "client_id": "cid", "client_secret": "s",
                "scopes": ["openid"], "expiry": "2999-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        fs::write(
            env.conf_dir.join("config.toml"),
            format!(
                "[endpoints]\npeople_api = \"{url}\"\ncarddav = \"{url}\"\ntoken = \"{url}/token\"\nuserinfo = \"{url}/userinfo\"\n",
                url = server.url()
            ),
        )
        .unwrap();
        env
    }

    fn cmd(&self) -> AssertCommand {
        let mut cmd = gcardvault_cmd();
        cmd.current_dir(self.temp_dir.path())
            .env_remove("GCARDVAULT_CONF_DIR")
            .env_remove("GCARDVAULT_OUTPUT_DIR")
            .env_remove("GCARDVAULT_CLIENT_ID")
            .env_remove("GCARDVAULT_CLIENT_SECRET")
            .env_remove("RUST_LOG")
            .arg("-c")
            .arg(&self.conf_dir)
            .arg("-o")
            .arg(&self.output_dir);
        cmd
    }

    fn vcf_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(&self.output_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".vcf"))
            .collect();
        names.sort();
        names
    }
}

fn gcardvault_cmd() -> AssertCommand {
    AssertCommand::cargo_bin("gcardvault").unwrap()
}

fn card(name: &str) -> String {
    format!("BEGIN:VCARD\nVERSION:3.0\nFN:{name}\nEND:VCARD\n")
}

fn mock_connections(server: &mut Server, contacts: &[(&str, &str, &str)]) -> Mock {
    let connections: Vec<_> = contacts
        .iter()
        .map(|(id, name, etag)| {
            serde_json::json!({
                "resourceName": format!("people/{id}"),
                "metadata": {"sources": [{"type": "CONTACT", "id": id, "etag": etag}]},
                "names": [{"displayName": name, "metadata": {"source": {"type": "CONTACT", "id": id}}}]
            })
        })
        .collect();

    server
        .mock("GET", "/v1/people/me/connections")
        .match_header("authorization", "Bearer test-token")
        .match_query(Matcher::UrlEncoded("personFields".into(), "metadata,names".into()))
        .with_header("content-type", "application/json")
        .with_body(serde_json::json!({ "connections": connections, "totalItems": contacts.len() }).to_string())
}

fn mock_report(server: &mut Server, contacts: &[(&str, &str, &str)]) -> Mock {
    let responses: String = contacts
        .iter()
        .map(|(id, name, _)| {
            format!(
                "<d:response><d:href>{ADDRESSBOOK_PATH}{id}</d:href><d:propstat><d:prop><card:address-data>{}</card:address-data></d:prop><d:status>HTTP/1.1 200 OK</d:status></d:propstat></d:response>",
                card(name)
            )
        })
        .collect();

    server
        .mock("REPORT", ADDRESSBOOK_PATH)
        .match_header("authorization", "Bearer test-token")
        .with_status(207)
        .with_header("content-type", "application/xml; charset=utf-8")
        .with_body(format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?><d:multistatus xmlns:d=\"DAV:\" xmlns:card=\"urn:ietf:params:xml:ns:carddav\">{responses}</d:multistatus>"
        ))
}

fn is_git_repo(dir: &Path) -> bool {
    dir.join(".git").is_dir()
}

// =============================================================================
// Usage Tests
// =============================================================================

#[test]
fn help_lists_commands() {
    gcardvault_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sync"))
        .stdout(predicate::str::contains("authorize"))
        .stdout(predicate::str::contains("--export-only"));
}

#[test]
fn no_arguments_prints_usage() {
    gcardvault_cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn version_is_printed() {
    gcardvault_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn usage_errors_exit_before_doing_anything() {
    let env = TestEnv::new();

    env.cmd().arg("sync").assert().code(2);
    env.cmd().args(["frobnicate", USER]).assert().code(2);
    env.cmd().args(["sync", USER, "extra"]).assert().code(2);
    env.cmd().args(["sync", USER, "--bogus"]).assert().code(2);

    assert!(!env.conf_dir.exists());
    assert!(!env.output_dir.exists());
}

#[test]
fn noop_creates_directories() {
    let env = TestEnv::new();

    env.cmd().args(["noop", USER]).assert().success();

    assert!(env.conf_dir.is_dir());
    assert!(env.output_dir.is_dir());
    assert!(!is_git_repo(&env.output_dir));
}

#[test]
fn directories_can_come_from_the_environment() {
    let env = TestEnv::new();

    gcardvault_cmd()
        .current_dir(env.temp_dir.path())
        .env("GCARDVAULT_CONF_DIR", &env.conf_dir)
        .env("GCARDVAULT_OUTPUT_DIR", &env.output_dir)
        .args(["noop", USER])
        .assert()
        .success();

    assert!(env.conf_dir.is_dir());
    assert!(env.output_dir.is_dir());
}

// =============================================================================
// Sync Tests
// =============================================================================

#[test]
fn export_only_sync_writes_vcards() {
    let mut server = Server::new();
    let contacts = [("AAA1", "Alice Example", "\"e1\""), ("BBB2", "Bob", "\"e2\"")];
    let list = mock_connections(&mut server, &contacts).expect(2).create();
    let report = mock_report(&mut server, &contacts).expect(1).create();
    let env = TestEnv::with_server(&server);

    env.cmd()
        .args(["sync", USER, "--export-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 contact(s) are up to date"))
        .stdout(predicate::str::contains("2 contact(s) need to be updated"))
        .stdout(predicate::str::contains(
            "Saved contact 'Alice Example' to alice_example_aaa1.vcf",
        ));

    assert_eq!(env.vcf_files(), ["alice_example_aaa1.vcf", "bob_bbb2.vcf"]);
    assert_eq!(
        fs::read_to_string(env.output_dir.join("bob_bbb2.vcf")).unwrap(),
        card("Bob")
    );
    assert!(!is_git_repo(&env.output_dir));

    let cache = fs::read_to_string(env.conf_dir.join(".etags")).unwrap();
    assert_eq!(cache, "aaa1\te1\nbbb2\te2\n");

    env.cmd()
        .args(["sync", USER, "-e"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 contact(s) are up to date"));

    list.assert();
    report.assert();
}

#[test]
fn sync_commits_to_a_new_vault() {
    let mut server = Server::new();
    let contacts = [("AAA1", "Alice Example", "e1")];
    let _list = mock_connections(&mut server, &contacts).create();
    let _report = mock_report(&mut server, &contacts).create();
    let env = TestEnv::with_server(&server);

    env.cmd()
        .args(["sync", USER])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created gcardvault repository"))
        .stdout(predicate::str::contains(
            "Committed 1 revision(s) to gcardvault repository",
        ));

    assert!(is_git_repo(&env.output_dir));
    assert_eq!(
        fs::read_to_string(env.output_dir.join(".gitignore")).unwrap(),
        "*\n!.gitignore\n!*.vcf\n"
    );

    env.cmd()
        .args(["sync", USER])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "No revisions to commit to gcardvault repository",
        ));
}

#[test]
fn clean_removes_files_of_deleted_contacts() {
    let mut server = Server::new();
    let env = TestEnv::with_server(&server);
    fs::create_dir_all(&env.output_dir).unwrap();
    fs::write(env.output_dir.join("gone_zzz9.vcf"), card("Gone")).unwrap();
    fs::write(env.output_dir.join("readme.txt"), "not a card").unwrap();

    let contacts = [("AAA1", "Alice", "e1")];
    let _list = mock_connections(&mut server, &contacts).create();
    let _report = mock_report(&mut server, &contacts).create();

    env.cmd()
        .args(["sync", USER, "-e", "--clean"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed file 'gone_zzz9.vcf'"));

    assert_eq!(env.vcf_files(), ["alice_aaa1.vcf"]);
    assert!(env.output_dir.join("readme.txt").exists());
}

#[test]
fn failed_contact_listing_is_fatal() {
    let mut server = Server::new();
    let _list = server
        .mock("GET", "/v1/people/me/connections")
        .match_query(Matcher::Any)
        .with_status(500)
        .create();
    let env = TestEnv::with_server(&server);

    env.cmd()
        .args(["sync", USER, "-e"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to list contacts"));

    assert!(env.vcf_files().is_empty());
}

#[test]
fn missing_vcard_names_the_contact() {
    let mut server = Server::new();
    let _list = mock_connections(
        &mut server,
        &[("AAA1", "Alice", "e1"), ("BBB2", "Bob", "e2")],
    )
    .create();
    let _report = mock_report(&mut server, &[("AAA1", "Alice", "e1")]).create();
    let env = TestEnv::with_server(&server);

    env.cmd()
        .args(["sync", USER, "-e"])
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "vCard could not be downloaded for contact 'Bob'",
        ));

    assert!(env.vcf_files().is_empty());
    assert!(!env.conf_dir.join(".etags").exists());
}
