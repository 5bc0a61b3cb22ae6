use super::*;
use crate::cli::PipelineArgs;
use crate::config::PipelineConfig;
use tempfile::TempDir;

fn touch(path: &Path) {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).expect("create parent directory");
    }
    std::fs::write(path, b"").expect("write file");
}

fn fake_data_dir(tmp: &TempDir) -> PathBuf {
    let dir = tmp.path().join("data");
    for name in [
        "MNI152_T1_2mm.nii.gz",
        "MNI152_T1_2mm_brain_mask.nii.gz",
        "avg152T1_csf.nii.gz",
        "avg152T1_gray.nii.gz",
        "avg152T1_white.nii.gz",
    ] {
        touch(&dir.join("std").join(name));
    }
    touch(&dir.join("map").join("FS_label.map.txt"));
    touch(&dir.join("transform").join("unity.tfm"));
    dir
}

fn base_args(tmp: &TempDir) -> PipelineArgs {
    let t1 = tmp.path().join("t1.nii.gz");
    let flair = tmp.path().join("flair.nii.gz");
    touch(&t1);
    touch(&flair);
    PipelineArgs {
        root: tmp.path().join("subj"),
        t1,
        flair: Some(flair),
        t2: None,
        pd: None,
        calc_space: "T1".to_string(),
        brain_mask: None,
        brain_mask_space: None,
        import_seg: None,
        model_dir: None,
        simple: false,
        pre_registered: false,
        trim_evident: false,
        radius: 1.0,
        spread: 2.0,
        levels: 5,
        data_dir: Some(fake_data_dir(tmp)),
        toolkit_dir: None,
    }
}

fn graph_for(args: &PipelineArgs) -> PipelineGraph {
    let config = PipelineConfig::from_args(args).expect("valid configuration");
    let layout = SubjectLayout::create(&config.root).expect("create subject layout");
    build(&config, &layout).expect("build graph")
}

fn labels(graph: &PipelineGraph) -> Vec<&str> {
    graph.tasks().iter().map(|t| t.label.as_str()).collect()
}

#[test]
fn computed_branch_extracts_and_segments() {
    let tmp = TempDir::new().unwrap();
    let graph = graph_for(&base_args(&tmp));

    assert!(graph.find("brain-extract").is_some());
    assert!(graph.find("import-seg").is_none());
    assert!(graph.find("mask-ingest").is_none());
    for label in ["csf-seg", "wg-sep", "refine-bts", "warp-bts"] {
        assert!(graph.find(label).is_some(), "missing {label}");
    }

    // FLAIR leads the CSF preference order.
    let csf = graph.find("csf-seg").unwrap();
    assert!(csf.inputs[0].ends_with("image/T1/FLAIR.norm.nii.gz"));

    // The four standard priors come down in the computed branch.
    let priors = labels(&graph)
        .into_iter()
        .filter(|l| l.starts_with("std-prior:"))
        .count();
    assert_eq!(priors, 4);
}

#[test]
fn external_segmentation_short_circuits_tissue_pipeline() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    let fs_dir = tmp.path().join("fs");
    touch(&fs_dir.join("mri").join("rawavg.mgz"));
    touch(&fs_dir.join("mri").join("aseg.mgz"));
    args.import_seg = Some(fs_dir);
    let graph = graph_for(&args);

    assert!(graph.find("import-seg").is_some());
    for absent in ["csf-seg", "wg-sep", "refine-bts", "brain-extract"] {
        assert!(graph.find(absent).is_none(), "unexpected {absent}");
    }
    // No tissue pipeline, no priors to resample.
    assert!(labels(&graph).iter().all(|l| !l.starts_with("std-prior:")));

    // The label map unlocks the volume report, captured from stdout.
    let report = graph.find("report").unwrap();
    assert!(report.outputs[0].ends_with("report/train/summary.txt"));
    match &report.steps[0] {
        Step::Run(call) => {
            assert_eq!(call.program, "fslstats");
            assert_eq!(call.stdout_to.as_deref(), Some(report.outputs[0].as_path()));
        }
        other => panic!("unexpected step {other:?}"),
    }
}

#[test]
fn external_segmentation_resamples_into_a_non_t1_calc_space() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    let fs_dir = tmp.path().join("fs");
    touch(&fs_dir.join("mri").join("rawavg.mgz"));
    touch(&fs_dir.join("mri").join("aseg.mgz"));
    args.import_seg = Some(fs_dir);
    args.calc_space = "FLAIR".to_string();
    let graph = graph_for(&args);

    // Relabelled in T1 space, then carried into the calculation space.
    let import = graph.find("import-seg").unwrap();
    let output_ends = |suffix: &str| import.outputs.iter().any(|o| o.ends_with(suffix));
    assert!(output_ends("image/T1/brainTissueSegmentation.nii.gz"), "{:?}", import.outputs);
    assert!(output_ends("image/FLAIR/brainTissueSegmentation.nii.gz"), "{:?}", import.outputs);
    assert!(
        import.inputs.iter().any(|i| i.ends_with("trans/T1_to_FLAIR.tfm")),
        "{:?}",
        import.inputs
    );
    match import.steps.last() {
        Some(Step::Run(call)) => {
            assert_eq!(call.program, "resample");
            assert_eq!(call.args.last().map(String::as_str), Some("nn"));
        }
        other => panic!("unexpected step {other:?}"),
    }

    // The transform edge makes the T1 registration a hard predecessor.
    let dep_labels: Vec<&str> = graph
        .dependencies(import)
        .iter()
        .map(|id| graph.task(*id).label.as_str())
        .collect();
    assert!(dep_labels.contains(&"intra-reg:T1"), "{dep_labels:?}");

    let mask = graph.find("brain-mask").unwrap();
    assert!(mask.outputs[0].ends_with("image/FLAIR/brain_mask.nii.gz"));
}

#[test]
fn imported_mask_in_another_space_gets_registered() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    let mask = tmp.path().join("mask.nii.gz");
    touch(&mask);
    args.brain_mask = Some(mask);
    args.brain_mask_space = Some("FLAIR".to_string());
    let graph = graph_for(&args);

    assert!(graph.find("mask-ingest").is_some());
    assert!(graph.find("brain-extract").is_none());
    let register = graph.find("mask-register").unwrap();
    assert!(register.inputs[0].ends_with("image/FLAIR/brain_mask.nii.gz"));
    assert!(register.outputs[0].ends_with("image/T1/brain_mask.nii.gz"));

    // Tissue priors still resample, the extraction mask prior does not.
    let priors: Vec<&str> = labels(&graph)
        .into_iter()
        .filter(|l| l.starts_with("std-prior:"))
        .collect();
    assert_eq!(priors.len(), 3);
    assert!(!priors.iter().any(|l| l.contains("brain_mask")));
}

#[test]
fn simple_mode_terminates_at_the_score_union() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    args.simple = true;
    let graph = graph_for(&args);

    assert_eq!(graph.terminals().len(), 1);
    assert!(graph.terminals()[0].ends_with("image/T1/model.free.wml.nii.gz"));
    for absent in ["warp-bts", "std-feature:T1", "feature:T1", "ks:FLAIR"] {
        assert!(graph.find(absent).is_none(), "unexpected {absent}");
    }

    args.trim_evident = true;
    let graph = graph_for(&args);
    assert!(graph.find("trim-evident").is_some());
    assert!(graph.terminals()[0].ends_with("image/T1/model.free.trimmed.nii.gz"));
}

#[test]
fn test_mode_builds_the_model_chain_per_modality() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    let model_dir = tmp.path().join("models");
    for modality in [Modality::T1, Modality::Flair] {
        for tissue in TissueClass::ALL {
            touch(&model_dir.join(model_file_name(modality, tissue)));
        }
    }
    args.model_dir = Some(model_dir);
    let graph = graph_for(&args);

    for label in [
        "feature:T1",
        "feature:FLAIR",
        "model-reg:FLAIR.WM",
        "model-combine:FLAIR",
        "ks:T1",
        "ks:FLAIR",
    ] {
        assert!(graph.find(label).is_some(), "missing {label}");
    }
    let reg = graph.find("model-reg:T1.CSF").unwrap();
    assert!(reg.outputs[0].ends_with("image/T1/model/T1.CSF.model.nii.gz"));

    let terminals = graph.terminals();
    assert_eq!(terminals.len(), 2);
    assert!(terminals.iter().all(|t| t.to_string_lossy().ends_with(".pvalue.nii.gz")));
}

#[test]
fn pre_registered_substitutes_the_identity_transform() {
    let tmp = TempDir::new().unwrap();
    let mut args = base_args(&tmp);
    args.pre_registered = true;
    let graph = graph_for(&args);

    let intra = graph.find("intra-reg:FLAIR").unwrap();
    match &intra.steps[0] {
        Step::Copy { from, to } => {
            assert!(from.ends_with("transform/unity.tfm"));
            assert!(to.ends_with("trans/FLAIR_to_T1.tfm"));
        }
        other => panic!("unexpected step {other:?}"),
    }
    // The resample into the calculation space still happens.
    assert!(matches!(intra.steps.last(), Some(Step::Run(call)) if call.program == "resample"));
}

#[test]
fn dependencies_are_derived_from_artifacts() {
    let tmp = TempDir::new().unwrap();
    let graph = graph_for(&base_args(&tmp));

    let csf = graph.find("csf-seg").unwrap();
    let deps = graph.dependencies(csf);
    let dep_labels: Vec<&str> = deps.iter().map(|id| graph.task(*id).label.as_str()).collect();
    assert!(dep_labels.contains(&"normalize:FLAIR"), "{dep_labels:?}");
    assert!(dep_labels.contains(&"brain-extract"), "{dep_labels:?}");
    assert!(dep_labels.contains(&"std-prior:avg152T1_csf.nii.gz"), "{dep_labels:?}");

    let order = graph.topo_order().unwrap();
    let position = |label: &str| {
        order
            .iter()
            .position(|id| graph.task(*id).label == label)
            .unwrap_or_else(|| panic!("{label} not scheduled"))
    };
    assert!(position("ingest:T1") < position("intra-reg:FLAIR"));
    assert!(position("intra-reg:FLAIR") < position("std-reg"));
    assert!(position("refine-bts") < position("model-free:FLAIR"));
}

#[test]
fn duplicate_outputs_are_rejected() {
    let mut b = GraphBuilder::new();
    let out = PathBuf::from("/tmp/x/one.nii.gz");
    b.add("first".to_string(), vec![], vec![out.clone()], vec![], vec![])
        .unwrap();
    let err = b
        .add("second".to_string(), vec![], vec![out], vec![], vec![])
        .unwrap_err()
        .to_string();
    assert!(err.contains("declared by both first and second"), "{err}");
}

#[test]
fn dangling_inputs_fail_validation() {
    let mut b = GraphBuilder::new();
    b.add(
        "needy".to_string(),
        vec![PathBuf::from("/tmp/x/missing.nii.gz")],
        vec![PathBuf::from("/tmp/x/out.nii.gz")],
        vec![],
        vec![],
    )
    .unwrap();
    let graph = PipelineGraph {
        tasks: b.tasks,
        producers: b.producers,
        raw_inputs: b.raw_inputs,
        terminals: vec![],
    };
    let err = graph.validate().unwrap_err().to_string();
    assert!(err.contains("dangling dependency"), "{err}");
}
