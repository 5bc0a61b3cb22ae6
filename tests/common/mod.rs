//! Shared fixture for end-to-end pipeline tests.
//!
//! Every external binary is replaced by a shell stub that touches the
//! output positions the real tool would write, so a whole run exercises
//! graph construction, scheduling, freshness, and reporting without any
//! imaging toolchain installed.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Stub bodies, keyed by command name. Argument positions mirror the real
/// tools' calling conventions.
const STUBS: &[(&str, &str)] = &[
    ("fslchfiletype", "touch \"$3\""),
    ("fslreorient2std", "touch \"$2\""),
    ("fslmaths", "for last in \"$@\"; do :; done; touch \"$last\""),
    ("fslstats", "echo '123456 789.0'"),
    ("mri_convert", "for last in \"$@\"; do :; done; touch \"$last\""),
    ("linRegister", "touch \"$3\" \"$4\""),
    ("resample", "touch \"$3\""),
    ("resampleVector", "touch \"$3\""),
    ("inhomogeneity", "touch \"$3\""),
    ("brainExtraction", "touch \"$3\""),
    ("extractCSF", "touch \"$4\""),
    ("separateWG", "touch \"$6\""),
    ("refineBTS", "touch \"$3\""),
    ("modelFree", "touch \"$3\""),
    ("localFeature", "touch \"$3\""),
    ("relabel", "touch \"$3\""),
    ("combine", "touch \"$2\""),
    ("ks", "touch \"$3\""),
];

pub struct PipelineFixture {
    pub tmp: TempDir,
    pub bin: PathBuf,
    pub data: PathBuf,
    pub root: PathBuf,
    pub t1: PathBuf,
    pub flair: PathBuf,
}

impl Default for PipelineFixture {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineFixture {
    pub fn new() -> Self {
        let tmp = TempDir::new().expect("create temp dir");
        let bin = tmp.path().join("bin");
        fs::create_dir(&bin).expect("create bin dir");
        for (name, body) in STUBS {
            write_script(&bin.join(name), body);
        }

        let data = tmp.path().join("data");
        for name in [
            "MNI152_T1_2mm.nii.gz",
            "MNI152_T1_2mm_brain_mask.nii.gz",
            "avg152T1_csf.nii.gz",
            "avg152T1_gray.nii.gz",
            "avg152T1_white.nii.gz",
        ] {
            touch(&data.join("std").join(name));
        }
        touch(&data.join("map").join("FS_label.map.txt"));
        touch(&data.join("transform").join("unity.tfm"));

        let t1 = tmp.path().join("t1.nii.gz");
        let flair = tmp.path().join("flair.nii.gz");
        touch(&t1);
        touch(&flair);

        let root = tmp.path().join("subj");
        Self {
            tmp,
            bin,
            data,
            root,
            t1,
            flair,
        }
    }

    /// `wmlpipe <subcommand>` wired to the stub toolchain.
    pub fn command(&self, subcommand: &str) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_wmlpipe"));
        let path = format!(
            "{}:{}",
            self.bin.display(),
            std::env::var("PATH").unwrap_or_default()
        );
        cmd.arg(subcommand)
            .arg("--root")
            .arg(&self.root)
            .arg("--t1")
            .arg(&self.t1)
            .arg("--flair")
            .arg(&self.flair)
            .arg("--data-dir")
            .arg(&self.data)
            .env("WMLPIPE_TOOLKIT_DIR", &self.bin)
            .env("WMLPIPE_FSL_DIR", &self.bin)
            .env("PATH", path)
            .env_remove("WMLPIPE_TOOL_WRAPPER")
            .env_remove("WMLPIPE_DATA_DIR");
        cmd
    }

    /// Replace one stub, e.g. to make a stage fail.
    pub fn rewrite_stub(&self, name: &str, body: &str) {
        write_script(&self.bin.join(name), body);
    }

    pub fn artifact(&self, rel: &str) -> PathBuf {
        self.root.join(rel)
    }

    /// Parsed `report/run/run.json` from the latest run.
    pub fn run_report(&self) -> serde_json::Value {
        let raw = fs::read_to_string(self.artifact("report/run/run.json"))
            .expect("read run report");
        serde_json::from_str(&raw).expect("parse run report")
    }

    /// Status string recorded for one task in the latest run report.
    pub fn task_status(&self, label: &str) -> String {
        let report = self.run_report();
        report["tasks"]
            .as_array()
            .expect("tasks array")
            .iter()
            .find(|t| t["label"] == label)
            .unwrap_or_else(|| panic!("no task {label} in run report"))["status"]
            .as_str()
            .expect("status string")
            .to_string()
    }

    /// Push a file's mtime far into the future so everything downstream of
    /// it is stale on the next run.
    pub fn future_date(&self, rel: &str) {
        let status = Command::new("touch")
            .arg("-d")
            .arg("2035-01-01")
            .arg(self.artifact(rel))
            .status()
            .expect("run touch");
        assert!(status.success());
    }
}

pub fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "command failed\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

pub fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent directory");
    }
    fs::write(path, b"").expect("write file");
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{body}\n")).expect("write stub");
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).expect("chmod stub");
}
