//! End-to-end pipeline runs: compile with baked preprocessing, simulate
//! through a dump directory and score against the float reference.

use rand::{rngs::StdRng, SeedableRng};

use quantgate::{
    calibration::{self, CalibrationDataset, CalibrationSource},
    compare::compare_outputs,
    compile::{self, compile_model},
    descriptor::Dtype,
    dump,
    simulate::ArtifactSimulator,
    testing, CalibrateMethod, CanonicalGraph, CompileConfig, CompiledArtifact, FineTunePolicy,
    Layout, NamedTensor, PreprocessSpec, QdqBackend, QuantConfig, ReferenceExecutor,
};

const SHAPE: [usize; 4] = [1, 3, 4, 4];

fn preprocess() -> PreprocessSpec {
    PreprocessSpec {
        input_dtype: Dtype::U8,
        input_range: (0.0, 255.0),
        mean: vec![104.0, 117.0, 123.0],
        std: vec![1.0, 1.0, 1.0],
        layout: Layout::Nchw,
    }
}

fn compile_fixture() -> (CanonicalGraph, CompiledArtifact) {
    let graph = CanonicalGraph::new(testing::two_output_model(4, 4), &[SHAPE.to_vec()]).unwrap();
    let config = CompileConfig {
        target: QdqBackend::TARGET.into(),
        input_shapes: vec![SHAPE.to_vec()],
        preprocess: Some(preprocess()),
        output_layout: Layout::Nchw,
    };
    let quant = QuantConfig {
        activation_bits: 8,
        weight_bits: 8,
        method: CalibrateMethod::MinMax,
        finetune: FineTunePolicy::NoFineTune,
        samples_count: 3,
    };
    let contract = compile::input_contract(&config, &graph).unwrap();
    let dataset = CalibrationDataset::build(
        &CalibrationSource::Synthetic { count: 3 },
        &contract,
        &mut StdRng::seed_from_u64(42),
    )
    .unwrap();
    let artifact = compile_model(&QdqBackend, &graph, &config, &quant, &dataset).unwrap();
    (graph, artifact)
}

#[test]
fn compile_simulate_compare_holds_up() {
    let (graph, artifact) = compile_fixture();

    // Through the file system, the way the CLI stages hand over.
    let dir = tempfile::tempdir().unwrap();
    let artifact_path = dir.path().join("model.qga");
    artifact.write(&artifact_path).unwrap();
    let artifact = CompiledArtifact::read(&artifact_path).unwrap();
    assert_eq!(artifact.io.inputs()[0].dtype(), Dtype::U8);

    // Raw input straight from an image file.
    let img_path = dir.path().join("probe.png");
    testing::write_solid_image(&img_path, 4, 4, 130);
    let contract = artifact.input_contract().unwrap();
    let raw = calibration::load_image(&img_path, &contract).unwrap();

    let loaded = QdqBackend.load(&artifact).unwrap();
    let result = loaded.run(&[raw.clone()]).unwrap();

    let dump_dir = dir.path().join("dumps");
    let input_name = artifact.io.inputs()[0].name().to_string();
    dump::write_input(&dump_dir, &NamedTensor::new(input_name, raw.clone())).unwrap();
    dump::write_outputs(&dump_dir, &result).unwrap();

    // Float reference over the same raw input and preprocessing.
    let reference = ReferenceExecutor::new(&graph).unwrap();
    let expected = reference.infer(&[raw], artifact.preprocess.as_ref()).unwrap();

    let dumped = dump::read_outputs(&dump_dir, artifact.io.outputs()).unwrap();
    let report = compare_outputs(&expected, &dumped).unwrap();

    assert_eq!(report.records.len(), 2);
    assert!(report.missing.is_empty());
    for record in &report.records {
        assert!(record.score > 0.99, "{}: {}", record.output_name, record.score);
    }
    assert!(report.mean_score.unwrap() > 0.99);
    assert!(report.recommendation.contains("good to ship"));
}

#[test]
fn reloaded_artifacts_simulate_bit_identically() {
    let (_, artifact) = compile_fixture();
    let raw = quantgate::TensorValue::from_u8(SHAPE.to_vec(), vec![140; 48]).unwrap();

    let first = QdqBackend.load(&artifact).unwrap().run(&[raw.clone()]).unwrap();
    let second = QdqBackend.load(&artifact).unwrap().run(&[raw]).unwrap();
    for (a, b) in first.outputs().iter().zip(second.outputs()) {
        assert_eq!(a.name, b.name);
        assert_eq!(a.value.to_f32_vec(), b.value.to_f32_vec());
    }
}

#[test]
fn lost_dumps_are_reported_not_fatal() {
    let (graph, artifact) = compile_fixture();
    let dir = tempfile::tempdir().unwrap();

    let raw = quantgate::TensorValue::from_u8(SHAPE.to_vec(), vec![120; 48]).unwrap();
    let loaded = QdqBackend.load(&artifact).unwrap();
    let result = loaded.run(&[raw.clone()]).unwrap();
    dump::write_outputs(dir.path(), &result).unwrap();

    // Lose the second output's dump.
    std::fs::remove_file(dir.path().join(dump::result_file_name(1, "neg"))).unwrap();

    let reference = ReferenceExecutor::new(&graph).unwrap();
    let expected = reference.infer(&[raw], artifact.preprocess.as_ref()).unwrap();
    let dumped = dump::read_outputs(dir.path(), artifact.io.outputs()).unwrap();
    let report = compare_outputs(&expected, &dumped).unwrap();

    assert_eq!(report.records.len(), 1);
    assert_eq!(report.records[0].output_name, "act");
    assert_eq!(report.missing, ["neg"]);
    assert!(report.mean_score.is_some());
}
