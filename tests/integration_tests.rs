//! Integration tests for the pairloop binary.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn pairloop() -> Command {
    cargo_bin_cmd!("pairloop")
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_project(dir: &TempDir) {
    pairloop()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

fn add_plan(dir: &TempDir, content: &str) {
    let plan = dir.path().join("feature.md");
    fs::write(&plan, content).unwrap();
    pairloop()
        .current_dir(dir.path())
        .args(["plan", "add", "feature.md"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Created plan #1"));
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        pairloop()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("plan"));
    }

    #[test]
    fn test_version() {
        pairloop()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("pairloop"));
    }

    #[test]
    fn test_init_creates_structure() {
        let dir = create_temp_project();

        pairloop()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("Initialized pairloop project"));

        assert!(dir.path().join(".pairloop/config.toml").exists());
        let gitignore = fs::read_to_string(dir.path().join(".pairloop/.gitignore")).unwrap();
        assert_eq!(gitignore.trim(), "*");
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = create_temp_project();
        init_project(&dir);
        let config = dir.path().join(".pairloop/config.toml");
        fs::write(&config, "[loop]\nmax_iterations = 3\n").unwrap();

        pairloop()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already initialized"));
        assert!(fs::read_to_string(&config).unwrap().contains("max_iterations = 3"));

        pairloop()
            .current_dir(dir.path())
            .args(["init", "--force"])
            .assert()
            .success();
        assert!(fs::read_to_string(&config).unwrap().contains("max_iterations = 10"));
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(
            dir.path().join(".pairloop/config.toml"),
            "[loop]\nmax_iterations = 0\n",
        )
        .unwrap();

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "list"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("max_iterations"));
    }
}

// =============================================================================
// Plan management
// =============================================================================

mod plans {
    use super::*;

    #[test]
    fn test_list_empty() {
        let dir = create_temp_project();
        init_project(&dir);

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No plans yet"));
    }

    #[test]
    fn test_add_then_list_and_show() {
        let dir = create_temp_project();
        init_project(&dir);
        add_plan(&dir, "# Add a health endpoint\n\nReturn 200 from /health.\n");

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("feature"))
            .stdout(predicate::str::contains("pending"));

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "show", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Return 200 from /health."))
            .stdout(predicate::str::contains("not captured yet"));
    }

    #[test]
    fn test_add_with_name_and_json_list() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(dir.path().join("p.md"), "do the thing").unwrap();

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "add", "p.md", "--name", "Thing"])
            .assert()
            .success();

        let output = pairloop()
            .current_dir(dir.path())
            .args(["plan", "list", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let plans: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(plans[0]["name"], "Thing");
        assert_eq!(plans[0]["status"], "pending");
        assert_eq!(plans[0]["content"], "do the thing");
    }

    #[test]
    fn test_add_empty_file_fails() {
        let dir = create_temp_project();
        init_project(&dir);
        fs::write(dir.path().join("empty.md"), "  \n").unwrap();

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "add", "empty.md"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("empty"));
    }

    #[test]
    fn test_show_and_status_unknown_plan() {
        let dir = create_temp_project();
        init_project(&dir);

        pairloop()
            .current_dir(dir.path())
            .args(["plan", "show", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Plan 42 not found"));

        pairloop()
            .current_dir(dir.path())
            .args(["status", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Plan 42 not found"));
    }

    #[test]
    fn test_status_of_new_plan() {
        let dir = create_temp_project();
        init_project(&dir);
        add_plan(&dir, "step one");

        pairloop()
            .current_dir(dir.path())
            .args(["status", "1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pending"))
            .stdout(predicate::str::contains("none yet"));
    }
}

// =============================================================================
// Running the loop
// =============================================================================

mod run {
    use super::*;

    #[test]
    fn test_run_outside_git_repository_fails() {
        let dir = create_temp_project();
        init_project(&dir);
        add_plan(&dir, "step one");

        pairloop()
            .current_dir(dir.path())
            .args(["run", "1", "--agent-cmd", "/bin/true"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("git repository"));
    }

    #[cfg(unix)]
    mod with_fake_agent {
        use super::*;
        use git2::{Repository, Signature};
        use std::os::unix::fs::PermissionsExt;

        /// An agent that answers developer prompts with the done marker and
        /// reviewer prompts with an approval.
        const AGREEING_AGENT: &str = r####"#!/bin/sh
for last; do :; done
case "$last" in
  "You are the reviewer"*)
    printf '%s\n' '{"type":"system","subtype":"init","session_id":"r1","model":"claude-sonnet-4-5"}'
    printf '%s\n' '{"type":"result","subtype":"success","result":"## Progress\nReviewed the endpoint.\n\n### Verdict\nREVIEWER_APPROVED REVIEWER_APPROVED REVIEWER_APPROVED!!!"}'
    ;;
  *)
    printf '%s\n' '{"type":"system","subtype":"init","session_id":"d1","model":"claude-sonnet-4-5"}'
    printf '%s\n' '{"type":"result","subtype":"success","result":"## Progress\nAdded the endpoint.\n\n## Status\nDEV_DONE DEV_DONE DEV_DONE!!!"}'
    ;;
esac
"####;

        /// An agent that never claims completion.
        const BUSY_AGENT: &str = r####"#!/bin/sh
for last; do :; done
case "$last" in
  "You are the reviewer"*)
    printf '%s\n' '{"type":"result","subtype":"success","result":"### Verdict\nFeedback: add tests"}'
    ;;
  *)
    printf '%s\n' '{"type":"result","subtype":"success","result":"## Progress\nStill working."}'
    ;;
esac
"####;

        fn git_project() -> TempDir {
            let dir = create_temp_project();
            let repo = Repository::init(dir.path()).unwrap();
            fs::write(dir.path().join("README.md"), "hello\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(std::path::Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
            let sig = Signature::now("Test", "test@example.com").unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
                .unwrap();
            dir
        }

        fn write_agent(dir: &TempDir, script: &str) -> String {
            let path = dir.path().join("agent.sh");
            fs::write(&path, script).unwrap();
            let mut perms = fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&path, perms).unwrap();
            path.to_string_lossy().into_owned()
        }

        #[test]
        fn test_run_completes_when_both_agree() {
            let dir = git_project();
            init_project(&dir);
            add_plan(&dir, "Add a /health endpoint");
            let agent = write_agent(&dir, AGREEING_AGENT);

            pairloop()
                .current_dir(dir.path())
                .args(["run", "1", "--agent-cmd", &agent])
                .assert()
                .success()
                .stdout(predicate::str::contains("Plan completed at iteration 1"));

            pairloop()
                .current_dir(dir.path())
                .args(["status", "1"])
                .assert()
                .success()
                .stdout(predicate::str::contains("completed"))
                .stdout(predicate::str::contains("Reviewed the endpoint."));
        }

        #[test]
        fn test_run_stops_at_ceiling_and_keeps_feedback() {
            let dir = git_project();
            init_project(&dir);
            add_plan(&dir, "Add a /health endpoint");
            let agent = write_agent(&dir, BUSY_AGENT);

            pairloop()
                .current_dir(dir.path())
                .args(["run", "1", "--agent-cmd", &agent, "--max-iterations", "2"])
                .assert()
                .success()
                .stdout(predicate::str::contains("ceiling of 2"));

            pairloop()
                .current_dir(dir.path())
                .args(["status", "1"])
                .assert()
                .success()
                .stdout(predicate::str::contains("stopped"))
                .stdout(predicate::str::contains("Iteration:  2"))
                .stdout(predicate::str::contains("add tests"));
        }
    }
}
