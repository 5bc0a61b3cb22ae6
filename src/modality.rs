//! Domain vocabulary: modalities, image spaces, and tissue classes.
//!
//! A `Space` is the coordinate frame an image has been resampled into; it is
//! also the namespace partition used by the artifact layout, so two tasks
//! agree on a dependency purely by naming the same (space, filename) pair.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Supported input sequence types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Modality {
    T1,
    Flair,
    T2,
    Pd,
}

impl Modality {
    pub const ALL: [Modality; 4] = [Modality::T1, Modality::Flair, Modality::T2, Modality::Pd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Modality::T1 => "T1",
            Modality::Flair => "FLAIR",
            Modality::T2 => "T2",
            Modality::Pd => "PD",
        }
    }
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Modality {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "T1" => Ok(Modality::T1),
            "FLAIR" => Ok(Modality::Flair),
            "T2" => Ok(Modality::T2),
            "PD" => Ok(Modality::Pd),
            other => Err(anyhow!("unknown modality {other:?} (expected T1, FLAIR, T2 or PD)")),
        }
    }
}

/// A symbolic coordinate frame, used as a namespace partition for artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Space {
    /// A modality's own native frame.
    Native(Modality),
    /// The standard atlas frame.
    Standard,
    /// The trained-model sub-space nested under a native frame.
    Model(Modality),
}

impl Space {
    /// Relative directory under `<root>/image/` for this space.
    pub fn rel_dir(&self) -> String {
        match self {
            Space::Native(m) => m.as_str().to_string(),
            Space::Standard => "STD".to_string(),
            Space::Model(m) => format!("{}/model", m.as_str()),
        }
    }

    /// Short name used when addressing transforms between spaces.
    pub fn trans_key(&self) -> &'static str {
        match self {
            Space::Native(m) => m.as_str(),
            Space::Standard => "std",
            // Model sub-spaces share the frame of their base modality; no
            // transform is ever addressed by them.
            Space::Model(m) => m.as_str(),
        }
    }
}

impl fmt::Display for Space {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.rel_dir())
    }
}

/// Anatomical tissue categories used for segmentation labels and per-class
/// statistical models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum TissueClass {
    Csf,
    Gm,
    Wm,
}

impl TissueClass {
    pub const ALL: [TissueClass; 3] = [TissueClass::Csf, TissueClass::Gm, TissueClass::Wm];

    pub fn as_str(&self) -> &'static str {
        match self {
            TissueClass::Csf => "CSF",
            TissueClass::Gm => "GM",
            TissueClass::Wm => "WM",
        }
    }

    /// Integer label in the brain-tissue segmentation map.
    pub fn label(&self) -> u32 {
        match self {
            TissueClass::Csf => 1,
            TissueClass::Gm => 2,
            TissueClass::Wm => 3,
        }
    }
}

impl fmt::Display for TissueClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Preference order for standard-space registration and white/gray
/// separation; FLAIR is excluded because its WM/CSF contrast misleads the
/// separation step.
pub const STRUCTURAL_ORDER: [Modality; 3] = [Modality::T1, Modality::T2, Modality::Pd];

/// Preference order for brain extraction.
pub const EXTRACTION_ORDER: [Modality; 4] =
    [Modality::Pd, Modality::T1, Modality::Flair, Modality::T2];

/// Preference order for CSF segmentation.
pub const CSF_ORDER: [Modality; 4] = [Modality::Flair, Modality::T1, Modality::T2, Modality::Pd];

/// Preference order for lesion-contrast steps (BTS refinement, model-free
/// scoring, reporting).
pub const CONTRAST_ORDER: [Modality; 3] = [Modality::Flair, Modality::T2, Modality::Pd];

/// First modality of `order` that is present, or a configuration error
/// naming the step so a partial graph is never built.
pub fn first_present(order: &[Modality], present: &[Modality], step: &str) -> Result<Modality> {
    order
        .iter()
        .copied()
        .find(|m| present.contains(m))
        .ok_or_else(|| {
            anyhow!(
                "no suitable modality for {step}: need one of {}",
                order
                    .iter()
                    .map(|m| m.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
}
