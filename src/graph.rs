//! Task graph builder.
//!
//! The graph is assembled in fixed stages, each stage's presence conditional
//! on the pipeline configuration. Branch selection is ordinary control flow
//! returning different task sets; task identity and existence, not just
//! arguments, depend on the configuration. The result is an immutable DAG
//! validated before anything executes: acyclic, no dangling dependency, no
//! output declared twice.

use crate::config::{model_file_name, ImportBranch, Mode, PipelineConfig, StandardData};
use crate::layout::SubjectLayout;
use crate::modality::{
    first_present, Modality, Space, TissueClass, CONTRAST_ORDER, CSF_ORDER, EXTRACTION_ORDER,
    STRUCTURAL_ORDER,
};
use crate::task::{Step, Task, TaskId, ToolCall};
use anyhow::{anyhow, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

/// Immutable task DAG for one configuration.
#[derive(Debug)]
pub struct PipelineGraph {
    tasks: Vec<Task>,
    producers: BTreeMap<PathBuf, TaskId>,
    raw_inputs: BTreeSet<PathBuf>,
    terminals: Vec<PathBuf>,
}

impl PipelineGraph {
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.0]
    }

    /// Task producing the artifact at `path`, if any.
    pub fn producer(&self, path: &Path) -> Option<TaskId> {
        self.producers.get(path).copied()
    }

    /// Artifacts the active mode must have produced for the run to count as
    /// successful.
    pub fn terminals(&self) -> &[PathBuf] {
        &self.terminals
    }

    /// Predecessors of a task: producers of its declared inputs plus its
    /// explicit `after` list.
    pub fn dependencies(&self, task: &Task) -> BTreeSet<TaskId> {
        let mut deps: BTreeSet<TaskId> = task
            .inputs
            .iter()
            .filter_map(|input| self.producer(input))
            .collect();
        deps.extend(task.after.iter().copied());
        deps.remove(&task.id);
        deps
    }

    /// Kahn's algorithm; a cycle is a fatal configuration error reported
    /// before any execution.
    pub fn topo_order(&self) -> Result<Vec<TaskId>> {
        let mut indegree = vec![0usize; self.tasks.len()];
        let mut dependents: Vec<Vec<TaskId>> = vec![Vec::new(); self.tasks.len()];
        for task in &self.tasks {
            for dep in self.dependencies(task) {
                indegree[task.id.0] += 1;
                dependents[dep.0].push(task.id);
            }
        }
        let mut queue: VecDeque<TaskId> = self
            .tasks
            .iter()
            .filter(|t| indegree[t.id.0] == 0)
            .map(|t| t.id)
            .collect();
        let mut order = Vec::with_capacity(self.tasks.len());
        while let Some(id) = queue.pop_front() {
            order.push(id);
            for dependent in &dependents[id.0] {
                indegree[dependent.0] -= 1;
                if indegree[dependent.0] == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
        if order.len() != self.tasks.len() {
            let stuck: Vec<&str> = self
                .tasks
                .iter()
                .filter(|t| indegree[t.id.0] > 0)
                .map(|t| t.label.as_str())
                .collect();
            return Err(anyhow!("task graph has a cycle through: {}", stuck.join(", ")));
        }
        Ok(order)
    }

    #[cfg(test)]
    pub fn find(&self, label: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.label == label)
    }

    #[cfg(test)]
    pub(crate) fn from_parts(
        tasks: Vec<Task>,
        raw_inputs: BTreeSet<PathBuf>,
        terminals: Vec<PathBuf>,
    ) -> Result<PipelineGraph> {
        let mut producers = BTreeMap::new();
        for task in &tasks {
            for output in &task.outputs {
                producers.insert(output.clone(), task.id);
            }
        }
        let graph = PipelineGraph {
            tasks,
            producers,
            raw_inputs,
            terminals,
        };
        graph.validate()?;
        Ok(graph)
    }

    fn validate(&self) -> Result<()> {
        for task in &self.tasks {
            for input in &task.inputs {
                if !self.raw_inputs.contains(input) && !self.producers.contains_key(input) {
                    return Err(anyhow!(
                        "dangling dependency: {} required by {} has no producer",
                        input.display(),
                        task.label
                    ));
                }
            }
        }
        self.topo_order()?;
        for terminal in &self.terminals {
            if !self.producers.contains_key(terminal) {
                return Err(anyhow!(
                    "terminal artifact {} has no producing task",
                    terminal.display()
                ));
            }
        }
        Ok(())
    }
}

struct GraphBuilder {
    tasks: Vec<Task>,
    producers: BTreeMap<PathBuf, TaskId>,
    raw_inputs: BTreeSet<PathBuf>,
}

impl GraphBuilder {
    fn new() -> Self {
        Self {
            tasks: Vec::new(),
            producers: BTreeMap::new(),
            raw_inputs: BTreeSet::new(),
        }
    }

    /// Register a pre-existing external file as a valid dependency root.
    fn source(&mut self, path: &Path) -> PathBuf {
        self.raw_inputs.insert(path.to_path_buf());
        path.to_path_buf()
    }

    fn add(
        &mut self,
        label: String,
        inputs: Vec<PathBuf>,
        outputs: Vec<PathBuf>,
        after: Vec<TaskId>,
        steps: Vec<Step>,
    ) -> Result<TaskId> {
        let id = TaskId(self.tasks.len());
        for output in &outputs {
            if let Some(previous) = self.producers.insert(output.clone(), id) {
                return Err(anyhow!(
                    "output {} declared by both {} and {label}",
                    output.display(),
                    self.tasks[previous.0].label
                ));
            }
        }
        self.tasks.push(Task {
            id,
            label,
            inputs,
            outputs,
            after,
            steps,
        });
        Ok(id)
    }
}

fn run(call: ToolCall) -> Step {
    Step::Run(call)
}

/// Build and validate the task graph for one configuration.
pub fn build(config: &PipelineConfig, layout: &SubjectLayout) -> Result<PipelineGraph> {
    let mut b = GraphBuilder::new();
    let present = config.present();
    let calc = config.calc_space;
    let calc_space = Space::Native(calc);

    // Stage 1: bring each sequence into the namespace.
    let mut native: BTreeMap<Modality, PathBuf> = BTreeMap::new();
    let mut ingest: BTreeMap<Modality, TaskId> = BTreeMap::new();
    for &m in &present {
        let src = b.source(config.source(m));
        let out = layout.image(Space::Native(m), &format!("{m}.nii.gz"))?;
        let id = b.add(
            format!("ingest:{m}"),
            vec![src.clone()],
            vec![out.clone()],
            vec![],
            vec![
                run(ToolCall::new("fslchfiletype").arg("NIFTI_GZ").arg(&src).arg(&out)),
                run(ToolCall::new("fslreorient2std").arg(&out).arg(&out)),
            ],
        )?;
        native.insert(m, out);
        ingest.insert(m, id);
    }
    let calc_native = native[&calc].clone();
    // Placeholder for the calculation space's own image, which exists
    // trivially once ingested.
    let base = b.add(
        format!("base:{calc}"),
        vec![calc_native.clone()],
        vec![],
        vec![ingest[&calc]],
        vec![],
    )?;

    // Stage 2: intra-subject registration of every sequence to the
    // calculation space.
    let mut in_calc: BTreeMap<Modality, PathBuf> = BTreeMap::new();
    let mut intra: BTreeMap<Modality, TaskId> = BTreeMap::new();
    for &m in &present {
        let moving = native[&m].clone();
        let forward = layout.transform(Space::Native(m), calc_space)?;
        let inverse = layout.transform(calc_space, Space::Native(m))?;
        let mut inputs = vec![moving.clone()];
        if m != calc {
            inputs.push(calc_native.clone());
        }
        // For the calculation space itself both directions resolve to the
        // same self-transform path; declare it once.
        let mut outputs = vec![forward.clone()];
        if inverse != forward {
            outputs.push(inverse.clone());
        }
        let mut steps = Vec::new();
        if config.pre_registered {
            let identity = b.source(&config.standard.identity_transform);
            inputs.push(identity.clone());
            steps.push(Step::Copy {
                from: identity.clone(),
                to: forward.clone(),
            });
            steps.push(Step::Copy {
                from: identity,
                to: inverse.clone(),
            });
        } else {
            steps.push(run(
                ToolCall::new("linRegister")
                    .arg(&calc_native)
                    .arg(&moving)
                    .arg(&forward)
                    .arg(&inverse),
            ));
        }
        if m != calc {
            let moved = layout.image(calc_space, &format!("{m}.nii.gz"))?;
            steps.push(run(
                ToolCall::new("resample")
                    .arg(&calc_native)
                    .arg(&moving)
                    .arg(&moved)
                    .arg(&forward),
            ));
            outputs.push(moved.clone());
            in_calc.insert(m, moved);
        } else {
            in_calc.insert(m, calc_native.clone());
        }
        let id = b.add(format!("intra-reg:{m}"), inputs, outputs, vec![base], steps)?;
        intra.insert(m, id);
    }

    // Stage 3: linear registration to the standard atlas space, then
    // resample the needed standard priors back to native.
    let m_std = first_present(&STRUCTURAL_ORDER, &present, "standard-space registration")?;
    let std_fixed = in_calc[&m_std].clone();
    let atlas = b.source(&config.standard.atlas);
    let std_to_calc = layout.transform(Space::Standard, calc_space)?;
    let calc_to_std = layout.transform(calc_space, Space::Standard)?;
    b.add(
        "std-reg".to_string(),
        vec![atlas.clone(), std_fixed.clone()],
        vec![std_to_calc.clone(), calc_to_std.clone()],
        intra.values().copied().collect(),
        vec![run(
            ToolCall::new("linRegister")
                .arg(&std_fixed)
                .arg(&atlas)
                .arg(&std_to_calc)
                .arg(&calc_to_std),
        )],
    )?;

    let needs_bts = !matches!(config.import, ImportBranch::ExternalSeg(_));
    let mut priors = Vec::new();
    if matches!(config.import, ImportBranch::Computed) {
        priors.push(config.standard.brain_mask.clone());
    }
    if needs_bts {
        priors.extend([
            config.standard.csf.clone(),
            config.standard.gm.clone(),
            config.standard.wm.clone(),
        ]);
    }
    let mut prior_in_calc: BTreeMap<String, PathBuf> = BTreeMap::new();
    for prior in priors {
        let name = StandardData::basename(&prior)?.to_string();
        let prior_src = b.source(&prior);
        let out = layout.image(calc_space, &name)?;
        let mut call = ToolCall::new("resample")
            .arg(&std_fixed)
            .arg(&prior_src)
            .arg(&out)
            .arg(&std_to_calc);
        if name.to_lowercase().contains("mask") {
            call = call.arg("nn");
        }
        b.add(
            format!("std-prior:{name}"),
            vec![prior_src, std_fixed.clone(), std_to_calc.clone()],
            vec![out.clone()],
            vec![],
            vec![run(call)],
        )?;
        prior_in_calc.insert(name, out);
    }

    // Stage 4: exactly one of the import/extraction branches contributes
    // the brain mask (and, for the segmentation import, the tissue map).
    let brain_mask = layout.image(calc_space, "brain_mask.nii.gz")?;
    let norm_mask = layout.image(calc_space, "norm.mask.nii.gz")?;
    let bts = layout.image(calc_space, "brainTissueSegmentation.nii.gz")?;
    match &config.import {
        ImportBranch::ExternalSeg(dir) => {
            let rawavg = b.source(&dir.join("mri").join("rawavg.mgz"));
            let aseg_src = b.source(&dir.join("mri").join("aseg.mgz"));
            let relabel_map = b.source(&config.standard.relabel_map);
            let aseg = layout.image(Space::Native(Modality::T1), "aseg.nii.gz")?;
            let mut inputs = vec![rawavg.clone(), aseg_src.clone(), relabel_map.clone()];
            let mut outputs = vec![aseg.clone()];
            let mut steps = vec![run(
                ToolCall::new("mri_convert")
                    .arg("-rt")
                    .arg("nearest")
                    .arg("-rl")
                    .arg(&rawavg)
                    .arg(&aseg_src)
                    .arg(&aseg),
            )];
            if calc == Modality::T1 {
                steps.push(run(
                    ToolCall::new("relabel").arg(&aseg).arg(&relabel_map).arg(&bts),
                ));
                outputs.push(bts.clone());
            } else {
                let bts_t1 =
                    layout.image(Space::Native(Modality::T1), "brainTissueSegmentation.nii.gz")?;
                let t1_to_calc = layout.transform(Space::Native(Modality::T1), calc_space)?;
                steps.push(run(
                    ToolCall::new("relabel")
                        .arg(&aseg)
                        .arg(&relabel_map)
                        .arg(&bts_t1),
                ));
                steps.push(run(
                    ToolCall::new("resample")
                        .arg(&calc_native)
                        .arg(&bts_t1)
                        .arg(&bts)
                        .arg(&t1_to_calc)
                        .arg("nn"),
                ));
                inputs.push(calc_native.clone());
                inputs.push(t1_to_calc);
                outputs.push(bts_t1);
                outputs.push(bts.clone());
            }
            b.add(
                "import-seg".to_string(),
                inputs,
                outputs,
                intra.values().copied().collect(),
                steps,
            )?;
            b.add(
                "brain-mask".to_string(),
                vec![bts.clone()],
                vec![brain_mask.clone()],
                vec![],
                vec![run(
                    ToolCall::new("fslmaths").arg(&bts).arg("-bin").arg(&brain_mask),
                )],
            )?;
            b.add(
                "norm-mask".to_string(),
                vec![bts.clone()],
                vec![norm_mask.clone()],
                vec![],
                vec![run(
                    ToolCall::new("fslmaths")
                        .arg(&bts)
                        .arg("-thr")
                        .arg(TissueClass::Wm.label())
                        .arg(&norm_mask),
                )],
            )?;
        }
        ImportBranch::BrainMask { file, space } => {
            let src = b.source(file);
            if *space == calc {
                b.add(
                    "mask-ingest".to_string(),
                    vec![src.clone()],
                    vec![brain_mask.clone()],
                    vec![],
                    vec![
                        run(ToolCall::new("fslchfiletype")
                            .arg("NIFTI_GZ")
                            .arg(&src)
                            .arg(&brain_mask)),
                        run(ToolCall::new("fslreorient2std").arg(&brain_mask).arg(&brain_mask)),
                    ],
                )?;
            } else {
                let staged = layout.image(Space::Native(*space), "brain_mask.nii.gz")?;
                b.add(
                    "mask-ingest".to_string(),
                    vec![src.clone()],
                    vec![staged.clone()],
                    vec![],
                    vec![
                        run(ToolCall::new("fslchfiletype")
                            .arg("NIFTI_GZ")
                            .arg(&src)
                            .arg(&staged)),
                        run(ToolCall::new("fslreorient2std").arg(&staged).arg(&staged)),
                    ],
                )?;
                let mask_to_calc = layout.transform(Space::Native(*space), calc_space)?;
                b.add(
                    "mask-register".to_string(),
                    vec![staged.clone(), calc_native.clone(), mask_to_calc.clone()],
                    vec![brain_mask.clone()],
                    vec![],
                    vec![run(
                        ToolCall::new("resample")
                            .arg(&calc_native)
                            .arg(&staged)
                            .arg(&brain_mask)
                            .arg(&mask_to_calc)
                            .arg("nn"),
                    )],
                )?;
            }
            add_norm_mask(&mut b, &brain_mask, &norm_mask)?;
        }
        ImportBranch::Computed => {
            let m_bex = first_present(&EXTRACTION_ORDER, &present, "brain extraction")?;
            let mask_prior = prior_in_calc
                [StandardData::basename(&config.standard.brain_mask)?]
            .clone();
            b.add(
                "brain-extract".to_string(),
                vec![in_calc[&m_bex].clone(), mask_prior.clone()],
                vec![brain_mask.clone()],
                vec![],
                vec![run(
                    ToolCall::new("brainExtraction")
                        .arg(&in_calc[&m_bex])
                        .arg(&mask_prior)
                        .arg(&brain_mask),
                )],
            )?;
            add_norm_mask(&mut b, &brain_mask, &norm_mask)?;
        }
    }

    // Stage 5: inhomogeneity correction of every sequence against the
    // normalization mask.
    let mut norm: BTreeMap<Modality, PathBuf> = BTreeMap::new();
    for &m in &present {
        let out = layout.image(calc_space, &format!("{m}.norm.nii.gz"))?;
        b.add(
            format!("normalize:{m}"),
            vec![in_calc[&m].clone(), norm_mask.clone()],
            vec![out.clone()],
            vec![],
            vec![run(
                ToolCall::new("inhomogeneity")
                    .arg(&in_calc[&m])
                    .arg(&norm_mask)
                    .arg(&out),
            )],
        )?;
        norm.insert(m, out);
    }

    // Stage 6: tissue segmentation sub-pipeline, short-circuited when a
    // segmentation was imported.
    if needs_bts {
        let m_csf = first_present(&CSF_ORDER, &present, "CSF segmentation")?;
        let csf_prior = prior_in_calc[StandardData::basename(&config.standard.csf)?].clone();
        let csf_mask = layout.image(calc_space, "csf_mask.nii.gz")?;
        let csf_id = b.add(
            "csf-seg".to_string(),
            vec![norm[&m_csf].clone(), brain_mask.clone(), csf_prior.clone()],
            vec![csf_mask.clone()],
            vec![],
            vec![run(
                ToolCall::new("extractCSF")
                    .arg(&norm[&m_csf])
                    .arg(&brain_mask)
                    .arg(&csf_prior)
                    .arg(&csf_mask)
                    .arg(0.5)
                    .arg(3u32),
            )],
        )?;

        let m_wg = first_present(&STRUCTURAL_ORDER, &present, "white/gray separation")?;
        let gm_prior = prior_in_calc[StandardData::basename(&config.standard.gm)?].clone();
        let wm_prior = prior_in_calc[StandardData::basename(&config.standard.wm)?].clone();
        let wg = layout.image(calc_space, "WG.separation.nii.gz")?;
        b.add(
            "wg-sep".to_string(),
            vec![
                norm[&m_wg].clone(),
                brain_mask.clone(),
                csf_mask.clone(),
                gm_prior.clone(),
                wm_prior.clone(),
            ],
            vec![wg.clone()],
            vec![csf_id],
            vec![run(
                ToolCall::new("separateWG")
                    .arg(&norm[&m_wg])
                    .arg(&brain_mask)
                    .arg(&csf_mask)
                    .arg(&gm_prior)
                    .arg(&wm_prior)
                    .arg(&wg)
                    .arg(0.3)
                    .arg(2u32),
            )],
        )?;

        let m_bts = first_present(&CONTRAST_ORDER, &present, "tissue-segmentation refinement")?;
        b.add(
            "refine-bts".to_string(),
            vec![norm[&m_bts].clone(), wg.clone()],
            vec![bts.clone()],
            vec![],
            vec![run(
                ToolCall::new("refineBTS")
                    .arg(&norm[&m_bts])
                    .arg(&wg)
                    .arg(&bts)
                    .arg(0.5)
                    .arg(0.2),
            )],
        )?;
    }

    // Stage 7: model-free scoring, per lesion-contrast modality, then the
    // union of the per-modality scores.
    let scoring: Vec<Modality> = CONTRAST_ORDER
        .iter()
        .copied()
        .filter(|m| present.contains(m))
        .collect();
    first_present(&CONTRAST_ORDER, &present, "model-free scoring")?;
    let mut scores = Vec::new();
    for &m in &scoring {
        let score = layout.image(calc_space, &format!("{m}.model.free.nii.gz"))?;
        b.add(
            format!("model-free:{m}"),
            vec![norm[&m].clone(), bts.clone()],
            vec![score.clone()],
            vec![],
            vec![run(
                ToolCall::new("modelFree")
                    .arg(&norm[&m])
                    .arg(&bts)
                    .arg(&score)
                    .arg(config.tuning.radius)
                    .arg(config.tuning.spread)
                    .arg(config.tuning.levels),
            )],
        )?;
        scores.push(score);
    }
    let wml = layout.image(calc_space, "model.free.wml.nii.gz")?;
    let mut union_call = ToolCall::new("fslmaths").arg(&scores[0]);
    for score in &scores[1..] {
        union_call = union_call.arg("-add").arg(score);
    }
    union_call = union_call.arg("-bin").arg(&wml);
    b.add(
        "wml-union".to_string(),
        scores.clone(),
        vec![wml.clone()],
        vec![],
        vec![run(union_call)],
    )?;

    let mut simple_terminal = wml.clone();
    if config.trim_evident {
        // Only voxels segmented as white matter can carry a lesion.
        let wm_mask = layout.image(calc_space, "wm.mask.nii.gz")?;
        let trimmed = layout.image(calc_space, "model.free.trimmed.nii.gz")?;
        let label = TissueClass::Wm.label();
        b.add(
            "trim-evident".to_string(),
            vec![wml.clone(), bts.clone()],
            vec![wm_mask.clone(), trimmed.clone()],
            vec![],
            vec![
                run(ToolCall::new("fslmaths")
                    .arg(&bts)
                    .arg("-thr")
                    .arg(label)
                    .arg("-uthr")
                    .arg(label)
                    .arg("-bin")
                    .arg(&wm_mask)),
                run(ToolCall::new("fslmaths")
                    .arg(&wml)
                    .arg("-mas")
                    .arg(&wm_mask)
                    .arg(&trimmed)),
            ],
        )?;
        simple_terminal = trimmed;
    }

    // Stage 8: mode branch.
    let mut terminals = Vec::new();
    let report_target;
    match &config.mode {
        Mode::Simple => {
            terminals.push(simple_terminal.clone());
            report_target = simple_terminal.clone();
        }
        Mode::Train => {
            let std_mask = b.source(&config.standard.brain_mask);
            let std_bts = layout.image(Space::Standard, "brainTissueSegmentation.nii.gz")?;
            let warp_bts = b.add(
                "warp-bts".to_string(),
                vec![bts.clone(), calc_to_std.clone(), std_mask.clone()],
                vec![std_bts.clone()],
                vec![],
                vec![run(
                    ToolCall::new("resample")
                        .arg(&std_mask)
                        .arg(&bts)
                        .arg(&std_bts)
                        .arg(&calc_to_std)
                        .arg("nn"),
                )],
            )?;
            for &m in &present {
                let std_norm = layout.image(Space::Standard, &format!("{m}.norm.nii.gz"))?;
                b.add(
                    format!("warp-norm:{m}"),
                    vec![norm[&m].clone(), calc_to_std.clone(), std_mask.clone()],
                    vec![std_norm.clone()],
                    vec![],
                    vec![run(
                        ToolCall::new("resample")
                            .arg(&std_mask)
                            .arg(&norm[&m])
                            .arg(&std_norm)
                            .arg(&calc_to_std),
                    )],
                )?;
                let feature = layout.image(Space::Standard, &format!("{m}.feature.nii.gz"))?;
                b.add(
                    format!("std-feature:{m}"),
                    vec![std_norm.clone(), std_bts.clone()],
                    vec![feature.clone()],
                    vec![warp_bts],
                    vec![run(
                        ToolCall::new("localFeature")
                            .arg(&std_norm)
                            .arg(&std_bts)
                            .arg(&feature)
                            .arg(config.tuning.radius)
                            .arg(config.tuning.levels),
                    )],
                )?;
                terminals.push(feature);
            }
            terminals.push(std_bts.clone());
            report_target = std_bts;
        }
        Mode::Test { model_dir } => {
            let model_space = Space::Model(calc);
            let mut first_pvalue = None;
            for &m in &present {
                let feature = layout.image(calc_space, &format!("{m}.feature.nii.gz"))?;
                b.add(
                    format!("feature:{m}"),
                    vec![norm[&m].clone(), brain_mask.clone()],
                    vec![feature.clone()],
                    vec![],
                    vec![run(
                        ToolCall::new("localFeature")
                            .arg(&norm[&m])
                            .arg(&brain_mask)
                            .arg(&feature)
                            .arg(config.tuning.radius)
                            .arg(config.tuning.levels),
                    )],
                )?;

                let mut tissue_models = Vec::new();
                for tissue in TissueClass::ALL {
                    let name = model_file_name(m, tissue);
                    let src = b.source(&model_dir.join(&name));
                    let out = layout.image(model_space, &name)?;
                    b.add(
                        format!("model-reg:{m}.{tissue}"),
                        vec![src.clone(), calc_native.clone(), std_to_calc.clone()],
                        vec![out.clone()],
                        vec![],
                        vec![run(
                            ToolCall::new("resampleVector")
                                .arg(&calc_native)
                                .arg(&src)
                                .arg(&out)
                                .arg(&std_to_calc),
                        )],
                    )?;
                    tissue_models.push(out);
                }

                let combined = layout.image(model_space, &format!("{m}.model.nii.gz"))?;
                let mut combine_call = ToolCall::new("combine").arg(&bts).arg(&combined);
                for model in &tissue_models {
                    combine_call = combine_call.arg(model);
                }
                let mut combine_inputs = vec![bts.clone()];
                combine_inputs.extend(tissue_models.iter().cloned());
                b.add(
                    format!("model-combine:{m}"),
                    combine_inputs,
                    vec![combined.clone()],
                    vec![],
                    vec![run(combine_call)],
                )?;

                let pvalue = layout.image(calc_space, &format!("{m}.pvalue.nii.gz"))?;
                b.add(
                    format!("ks:{m}"),
                    vec![feature.clone(), combined.clone()],
                    vec![pvalue.clone()],
                    vec![],
                    vec![run(
                        ToolCall::new("ks").arg(&feature).arg(&combined).arg(&pvalue),
                    )],
                )?;
                if first_pvalue.is_none() {
                    first_pvalue = Some(pvalue.clone());
                }
                terminals.push(pvalue);
            }
            report_target = first_pvalue.ok_or_else(|| anyhow!("no modality to test"))?;
        }
    }

    // Stage 9: reporting, constructible only when the segmentation import
    // supplies a label map.
    if matches!(config.import, ImportBranch::ExternalSeg(_)) {
        let summary = layout.report(config.mode.name(), "summary.txt")?;
        b.add(
            "report".to_string(),
            vec![report_target.clone()],
            vec![summary.clone()],
            vec![],
            vec![run(
                ToolCall::new("fslstats")
                    .arg(&report_target)
                    .arg("-V")
                    .capture_stdout(summary.clone()),
            )],
        )?;
        terminals.push(summary);
    }

    let graph = PipelineGraph {
        tasks: b.tasks,
        producers: b.producers,
        raw_inputs: b.raw_inputs,
        terminals,
    };
    graph.validate()?;
    Ok(graph)
}

fn add_norm_mask(b: &mut GraphBuilder, brain_mask: &Path, norm_mask: &Path) -> Result<()> {
    b.add(
        "norm-mask".to_string(),
        vec![brain_mask.to_path_buf()],
        vec![norm_mask.to_path_buf()],
        vec![],
        vec![run(
            ToolCall::new("fslmaths")
                .arg(brain_mask)
                .arg("-bin")
                .arg(norm_mask),
        )],
    )?;
    Ok(())
}

#[cfg(test)]
#[path = "graph_tests.rs"]
mod tests;
