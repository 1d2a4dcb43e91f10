//! End-to-end replication runs against a fake `zfs`.
//!
//! The fake keeps each filesystem's catalog in `<state>/<fs with / as _>.tsv` using the
//! `zfs get -Hp` line format. `send` writes a one-line stream naming the snapshot and its
//! creation time, `receive` appends the stream to `received.log` and adds the snapshot to
//! the destination catalog. Streams of snapshots named `broken` fail to send and streams of
//! snapshots named `corrupt` fail to receive.

use predicates::prelude::*;
use std::os::unix::fs::PermissionsExt;

const FAKE_ZFS: &str = r#"#!/bin/sh
state=__STATE__
catalog() { echo "$state/$(echo "$1" | tr / _).tsv"; }
case "$1" in
  get)
    file=$(catalog "$5")
    [ -f "$file" ] || { echo "cannot open '$5': dataset does not exist" >&2; exit 1; }
    printf '%s\tcreation\t1\t-\n' "$5"
    cat "$file"
    ;;
  send)
    if [ "$2" = "-i" ]; then kind="incremental $3"; snap=$4; else kind=full; snap=$2; fi
    case "$snap" in *@broken) echo "cannot send $snap" >&2; exit 1 ;; esac
    creation=$(awk -F '\t' -v snap="$snap" '$1 == snap { print $3 }' "$(catalog "${snap%@*}")")
    echo "$kind $snap $creation"
    ;;
  receive)
    fs=$3
    stream=$(cat)
    [ -n "$stream" ] || { echo "empty stream" >&2; exit 1; }
    echo "$stream" >> "$state/received.log"
    case "$stream" in *@corrupt*) echo "invalid stream" >&2; exit 1 ;; esac
    creation=${stream##* }
    rest=${stream% *}
    snap=${rest##* }
    printf '%s@%s\tcreation\t%s\t-\n' "$fs" "${snap#*@}" "$creation" >> "$(catalog "$fs")"
    ;;
  *)
    exit 2
    ;;
esac
"#;

// `-I` listens until the sender's stream shows up, `-O` hands the stream over
const FAKE_MBUFFER: &str = r#"#!/bin/sh
state=__STATE__
case " $* " in
  *" -I "*)
    echo $$ > "$state/listening.tmp" && mv "$state/listening.tmp" "$state/listening"
    while [ ! -f "$state/wire" ]; do sleep 0.05; done
    cat "$state/wire"
    rm -f "$state/wire" "$state/listening"
    ;;
  *" -O "*)
    cat > "$state/wire.tmp" && mv "$state/wire.tmp" "$state/wire"
    ;;
  *)
    exit 2
    ;;
esac
"#;

const FAKE_FUSER: &str = r#"#!/bin/sh
state=__STATE__
echo "$*" >> "$state/fuser.log"
case "$1" in
  -s) [ -f "$state/listening" ] ;;
  -k)
    [ -f "$state/listening" ] || exit 1
    kill "$(cat "$state/listening")" 2>/dev/null
    rm -f "$state/listening"
    ;;
  *) exit 2 ;;
esac
"#;

struct Fixture {
    state: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let state = tempfile::tempdir().unwrap();
        let fixture = Self { state };
        std::fs::create_dir(fixture.bin_dir()).unwrap();
        fixture.install("zfs", FAKE_ZFS);
        fixture.install("mbuffer", FAKE_MBUFFER);
        fixture.install("fuser", FAKE_FUSER);
        fixture
    }

    fn bin_dir(&self) -> std::path::PathBuf {
        self.state.path().join("bin")
    }

    fn install(&self, name: &str, script: &str) {
        let path = self.bin_dir().join(name);
        let script = script.replace("__STATE__", &self.state.path().display().to_string());
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    fn catalog_path(&self, filesystem: &str) -> std::path::PathBuf {
        self.state
            .path()
            .join(format!("{}.tsv", filesystem.replace('/', "_")))
    }

    fn set_catalog(&self, filesystem: &str, snapshots: &[(&str, u64)]) {
        let lines: String = snapshots
            .iter()
            .map(|(name, creation)| format!("{filesystem}@{name}\tcreation\t{creation}\t-\n"))
            .collect();
        std::fs::write(self.catalog_path(filesystem), lines).unwrap();
    }

    fn snapshot_names(&self, filesystem: &str) -> Vec<String> {
        std::fs::read_to_string(self.catalog_path(filesystem))
            .unwrap()
            .lines()
            .filter_map(|line| line.split('\t').next())
            .filter_map(|snapshot| snapshot.split_once('@'))
            .map(|(_, name)| name.to_string())
            .collect()
    }

    fn received(&self) -> Vec<String> {
        match std::fs::read_to_string(self.state.path().join("received.log")) {
            Ok(log) => log.lines().map(str::to_string).collect(),
            Err(_) => vec![],
        }
    }

    fn is_listening(&self) -> bool {
        self.state.path().join("listening").exists()
    }

    fn zsync(&self) -> assert_cmd::Command {
        let mut cmd = assert_cmd::Command::cargo_bin("zsync").unwrap();
        let path = format!(
            "{}:{}",
            self.bin_dir().display(),
            std::env::var("PATH").unwrap_or_default()
        );
        cmd.env("PATH", path)
            .env_remove("RUST_LOG")
            .arg("--zfs-path")
            .arg(self.bin_dir().join("zfs"))
            .timeout(std::time::Duration::from_secs(60));
        cmd
    }

    fn zsync_piped(&self) -> assert_cmd::Command {
        let mut cmd = self.zsync();
        cmd.args(["--transport", "ssh"]);
        cmd
    }

    fn zsync_buffered(&self) -> assert_cmd::Command {
        let mut cmd = self.zsync();
        cmd.args(["--transport", "mbuffer", "--listen-poll-interval", "20ms"])
            .arg("--mbuffer-path")
            .arg(self.bin_dir().join("mbuffer"));
        cmd
    }
}

#[test]
fn test_full_send_to_empty_destination() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200)]);
    fixture.set_catalog("pool/dst", &[]);
    fixture
        .zsync_piped()
        .args(["pool/src", "pool/dst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("missing initial snapshot: a"))
        .stdout(predicate::str::contains("missing snapshot: b (predecessor: a)"));
    assert_eq!(
        fixture.received(),
        vec!["full pool/src@a 100", "incremental pool/src@a pool/src@b 200"]
    );
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a", "b"]);
}

#[test]
fn test_incremental_tail_only() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200), ("c", 300)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["--summary", "pool/src", "pool/dst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("snapshots already present: 1"))
        .stdout(predicate::str::contains("incremental sends: 2"));
    assert_eq!(
        fixture.received(),
        vec![
            "incremental pool/src@a pool/src@b 200",
            "incremental pool/src@b pool/src@c 300",
        ]
    );
}

#[test]
fn test_rerun_is_a_no_op() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["pool/src", "pool/dst"])
        .assert()
        .success();
    assert_eq!(fixture.received().len(), 1);
    fixture
        .zsync_piped()
        .args(["--summary", "pool/src", "pool/dst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("full sends: 0"))
        .stdout(predicate::str::contains("incremental sends: 0"));
    assert_eq!(fixture.received().len(), 1);
}

#[test]
fn test_equal_creation_times_are_ordered_by_name() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("y", 100), ("x", 100)]);
    fixture.set_catalog("pool/dst", &[]);
    fixture
        .zsync_piped()
        .args(["pool/src", "pool/dst"])
        .assert()
        .success();
    assert_eq!(
        fixture.received(),
        vec!["full pool/src@x 100", "incremental pool/src@x pool/src@y 100"]
    );
}

#[test]
fn test_dry_run_prints_commands_and_receives_nothing() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["--dry-run", "pool/src", "pool/dst"])
        .assert()
        .success()
        .stdout(predicate::str::contains("send -i pool/src@a pool/src@b"))
        .stdout(predicate::str::contains("receive -F pool/dst"));
    assert!(fixture.received().is_empty());
}

#[test]
fn test_catalog_failure_exits_with_error() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["pool/src", "pool/missing"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains(
            "failed reading snapshot catalog from pool/missing",
        ));
    assert!(fixture.received().is_empty());
}

#[test]
fn test_malformed_locator_exits_with_error() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["pool/src", "ssh://backup1:pool/dst"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("malformed remote locator"));
}

#[test]
fn test_receive_failure_stops_the_chain() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("corrupt", 200), ("c", 300)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_piped()
        .args(["--summary", "pool/src", "pool/dst"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("transfer of a -> corrupt failed"))
        .stdout(predicate::str::contains("incremental sends: 0"));
    assert_eq!(fixture.received(), vec!["incremental pool/src@a pool/src@corrupt 200"]);
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a"]);
}

#[test]
fn test_buffered_relay_replicates_and_frees_port() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200), ("c", 300)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_buffered()
        .args(["pool/src", "pool/dst"])
        .assert()
        .success();
    assert_eq!(
        fixture.received(),
        vec![
            "incremental pool/src@a pool/src@b 200",
            "incremental pool/src@b pool/src@c 300",
        ]
    );
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a", "b", "c"]);
    assert!(!fixture.is_listening());
    let fuser_log = std::fs::read_to_string(fixture.state.path().join("fuser.log")).unwrap();
    // once before the first step and once after each step
    assert_eq!(
        fuser_log.lines().filter(|line| line.starts_with("-k")).count(),
        3
    );
}

#[test]
fn test_buffered_sender_failure_aborts_and_frees_port() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("broken", 200), ("c", 300)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_buffered()
        .args(["pool/src", "pool/dst"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("transfer of a -> broken failed"));
    assert!(!fixture.is_listening());
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a"]);
}

#[test]
fn test_buffered_receiver_failure_aborts_and_frees_port() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100), ("corrupt", 200), ("c", 300)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    fixture
        .zsync_buffered()
        .args(["pool/src", "pool/dst"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("transfer of a -> corrupt failed"))
        .stdout(predicate::str::contains("receive -F pool/dst"));
    assert_eq!(fixture.received(), vec!["incremental pool/src@a pool/src@corrupt 200"]);
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a"]);
    assert!(!fixture.is_listening());
}

#[test]
fn test_port_cleanup_failure_is_logged_and_run_continues() {
    let fixture = Fixture::new();
    // probing works, killing always fails
    fixture.install(
        "fuser",
        r#"#!/bin/sh
state=__STATE__
case "$1" in
  -s) [ -f "$state/listening" ] ;;
  *) echo "fuser: cannot kill" >&2; exit 5 ;;
esac
"#,
    );
    fixture.set_catalog("pool/src", &[("a", 100), ("b", 200)]);
    fixture.set_catalog("pool/dst", &[("a", 100)]);
    let assert = fixture
        .zsync_buffered()
        .args(["pool/src", "pool/dst"])
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "failed freeing coordination port 47099 on pool/dst",
        ))
        .stdout(predicate::str::contains("exit status: 5"));
    let stdout = String::from_utf8_lossy(&assert.get_output().stdout).to_string();
    // before the first step and after the only step
    assert_eq!(stdout.matches("failed freeing coordination port").count(), 2);
    assert_eq!(fixture.received(), vec!["incremental pool/src@a pool/src@b 200"]);
    assert_eq!(fixture.snapshot_names("pool/dst"), vec!["a", "b"]);
}

#[test]
fn test_buffered_receiver_exiting_early_is_an_error() {
    let fixture = Fixture::new();
    fixture.set_catalog("pool/src", &[("a", 100)]);
    fixture.set_catalog("pool/dst", &[]);
    fixture
        .zsync()
        .args([
            "--transport",
            "mbuffer",
            "--mbuffer-path",
            "false",
            "--listen-timeout",
            "10s",
            "pool/src",
            "pool/dst",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("exited before listening"));
    assert!(fixture.received().is_empty());
}
