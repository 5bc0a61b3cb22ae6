//! Pipeline configuration: derived once from the CLI, read-only afterwards.
//!
//! The configuration determines the topology of the task graph (which task
//! variants exist at all), not just parameter values, so every invalid
//! combination must be rejected here, before a single task is built and with
//! no partial filesystem state.

use crate::cli::PipelineArgs;
use crate::modality::{Modality, TissueClass};
use anyhow::{anyhow, Context, Result};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

/// Operating mode, selected by `--simple` / `--model-dir` / neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Warp segmentation and normalized images to the atlas space for later
    /// model construction.
    Train,
    /// Compare the subject against a trained model directory.
    Test { model_dir: PathBuf },
    /// Terminate after model-free scoring.
    Simple,
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Test { .. } => "test",
            Mode::Simple => "simple",
        }
    }
}

/// How the brain mask (and possibly the tissue segmentation) enters the
/// pipeline. Exactly one branch is active; selecting no explicit import
/// falls back deterministically to `Computed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportBranch {
    /// Import an external segmentation directory; short-circuits brain
    /// extraction and tissue segmentation entirely.
    ExternalSeg(PathBuf),
    /// Import a precomputed brain mask and register it into the calculation
    /// space.
    BrainMask { file: PathBuf, space: Modality },
    /// Compute the brain mask from scratch using standard-space priors.
    Computed,
}

/// Numeric tuning parameters passed through unchanged to specific tasks.
#[derive(Debug, Clone, Copy)]
pub struct Tuning {
    pub radius: f64,
    pub spread: f64,
    pub levels: u32,
}

/// Resolved paths into the standard atlas data directory.
#[derive(Debug, Clone)]
pub struct StandardData {
    pub atlas: PathBuf,
    pub brain_mask: PathBuf,
    pub csf: PathBuf,
    pub gm: PathBuf,
    pub wm: PathBuf,
    pub relabel_map: PathBuf,
    pub identity_transform: PathBuf,
}

impl StandardData {
    /// Resolve the data directory (flag, then `WMLPIPE_DATA_DIR`, then the
    /// platform data dir) and verify every required file exists.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let dir = match explicit {
            Some(dir) => dir.to_path_buf(),
            None => match env::var_os("WMLPIPE_DATA_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => dirs::data_local_dir()
                    .ok_or_else(|| anyhow!("cannot determine data directory"))?
                    .join("wmlpipe"),
            },
        };
        if !dir.is_dir() {
            return Err(anyhow!(
                "standard data directory not found at {} (pass --data-dir or set WMLPIPE_DATA_DIR)",
                dir.display()
            ));
        }
        let std_dir = dir.join("std");
        let data = Self {
            atlas: std_dir.join("MNI152_T1_2mm.nii.gz"),
            brain_mask: std_dir.join("MNI152_T1_2mm_brain_mask.nii.gz"),
            csf: std_dir.join("avg152T1_csf.nii.gz"),
            gm: std_dir.join("avg152T1_gray.nii.gz"),
            wm: std_dir.join("avg152T1_white.nii.gz"),
            relabel_map: dir.join("map").join("FS_label.map.txt"),
            identity_transform: dir.join("transform").join("unity.tfm"),
        };
        for file in [
            &data.atlas,
            &data.brain_mask,
            &data.csf,
            &data.gm,
            &data.wm,
            &data.relabel_map,
            &data.identity_transform,
        ] {
            if !file.is_file() {
                return Err(anyhow!("missing standard data file {}", file.display()));
            }
        }
        Ok(data)
    }

    /// Basename under which a standard prior lands once resampled into a
    /// native space.
    pub fn basename(path: &Path) -> Result<&str> {
        path.file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("standard data file has no basename: {}", path.display()))
    }
}

/// Immutable per-run configuration. Built once; the graph builder reads it.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub root: PathBuf,
    pub inputs: BTreeMap<Modality, PathBuf>,
    pub calc_space: Modality,
    pub mode: Mode,
    pub import: ImportBranch,
    pub pre_registered: bool,
    pub trim_evident: bool,
    pub tuning: Tuning,
    pub standard: StandardData,
}

impl PipelineConfig {
    pub fn from_args(args: &PipelineArgs) -> Result<Self> {
        let mut inputs = BTreeMap::new();
        inputs.insert(Modality::T1, args.t1.clone());
        for (modality, file) in [
            (Modality::Flair, &args.flair),
            (Modality::T2, &args.t2),
            (Modality::Pd, &args.pd),
        ] {
            if let Some(file) = file {
                inputs.insert(modality, file.clone());
            }
        }
        if inputs.len() < 2 {
            return Err(anyhow!(
                "at least one of --flair, --t2 or --pd must accompany --t1"
            ));
        }
        for (modality, file) in &inputs {
            if !file.is_file() {
                return Err(anyhow!("{modality} image does not exist: {}", file.display()));
            }
        }

        let calc_space: Modality = args
            .calc_space
            .parse()
            .context("invalid --calc-space")?;
        if !inputs.contains_key(&calc_space) {
            return Err(anyhow!(
                "calculation space {calc_space} is not among the provided sequences"
            ));
        }

        let import = Self::import_branch(args, &inputs)?;
        let mode = Self::mode(args)?;
        if let Mode::Test { model_dir } = &mode {
            validate_model_dir(model_dir, &inputs)?;
        }

        let standard = StandardData::resolve(args.data_dir.as_deref())?;

        Ok(Self {
            root: args.root.clone(),
            inputs,
            calc_space,
            mode,
            import,
            pre_registered: args.pre_registered,
            trim_evident: args.trim_evident,
            tuning: Tuning {
                radius: args.radius,
                spread: args.spread,
                levels: args.levels,
            },
            standard,
        })
    }

    fn import_branch(
        args: &PipelineArgs,
        inputs: &BTreeMap<Modality, PathBuf>,
    ) -> Result<ImportBranch> {
        match (&args.import_seg, &args.brain_mask) {
            (Some(_), Some(_)) => Err(anyhow!(
                "--import-seg and --brain-mask are mutually exclusive"
            )),
            (Some(dir), None) => {
                for rel in ["mri/rawavg.mgz", "mri/aseg.mgz"] {
                    let file = dir.join(rel);
                    if !file.is_file() {
                        return Err(anyhow!(
                            "segmentation import is missing {}",
                            file.display()
                        ));
                    }
                }
                Ok(ImportBranch::ExternalSeg(dir.clone()))
            }
            (None, Some(file)) => {
                let space: Modality = args
                    .brain_mask_space
                    .as_deref()
                    .ok_or_else(|| anyhow!("--brain-mask requires --brain-mask-space"))?
                    .parse()
                    .context("invalid --brain-mask-space")?;
                if !inputs.contains_key(&space) {
                    return Err(anyhow!(
                        "brain mask space {space} is not among the provided sequences"
                    ));
                }
                if !file.is_file() {
                    return Err(anyhow!("brain mask does not exist: {}", file.display()));
                }
                Ok(ImportBranch::BrainMask {
                    file: file.clone(),
                    space,
                })
            }
            (None, None) => Ok(ImportBranch::Computed),
        }
    }

    fn mode(args: &PipelineArgs) -> Result<Mode> {
        match (&args.model_dir, args.simple) {
            (Some(_), true) => Err(anyhow!("--simple and --model-dir are mutually exclusive")),
            (Some(dir), false) => Ok(Mode::Test {
                model_dir: dir.clone(),
            }),
            (None, true) => Ok(Mode::Simple),
            (None, false) => Ok(Mode::Train),
        }
    }

    /// Present modalities in canonical order.
    pub fn present(&self) -> Vec<Modality> {
        Modality::ALL
            .iter()
            .copied()
            .filter(|m| self.inputs.contains_key(m))
            .collect()
    }

    pub fn source(&self, modality: Modality) -> &Path {
        // Membership is established during construction.
        &self.inputs[&modality]
    }
}

/// Trained-model filename for one (modality, tissue) pair.
pub fn model_file_name(modality: Modality, tissue: TissueClass) -> String {
    format!("{modality}.{tissue}.model.nii.gz")
}

fn validate_model_dir(model_dir: &Path, inputs: &BTreeMap<Modality, PathBuf>) -> Result<()> {
    for modality in inputs.keys() {
        for tissue in TissueClass::ALL {
            let file = model_dir.join(model_file_name(*modality, tissue));
            if !file.is_file() {
                return Err(anyhow!("no trained model found at {}", file.display()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
