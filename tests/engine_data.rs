use std::{collections::HashMap, fs::File};

use serde::Deserialize;

use prompt_experiments::{
    AssignmentEngine, AssignmentReason, EngineConfig, Experiment, ExperimentContext,
    ExperimentResult, StatisticsEngine,
};

#[derive(Debug, Deserialize)]
struct AssignmentCase {
    experiment_id: String,
    context: ExperimentContext,
    variant_id: String,
    assignment_reason: AssignmentReason,
}

fn experiments() -> HashMap<String, Experiment> {
    let experiments: Vec<Experiment> =
        serde_json::from_reader(File::open("tests/data/experiments.json").unwrap()).unwrap();
    experiments
        .into_iter()
        .map(|experiment| {
            experiment.validate().unwrap();
            (experiment.id.clone(), experiment)
        })
        .collect()
}

fn assignment_cases() -> Vec<AssignmentCase> {
    serde_json::from_reader(File::open("tests/data/assignments.json").unwrap()).unwrap()
}

#[test]
fn assignment_test_data() {
    let _ = env_logger::builder().is_test(true).try_init();

    let experiments = experiments();
    let engine = AssignmentEngine::new(&EngineConfig::default());

    for case in assignment_cases() {
        print!(
            "test {} / {} ... ",
            case.experiment_id, case.context.session_id
        );
        let experiment = &experiments[&case.experiment_id];

        let assignment = engine.assign(experiment, &case.context);

        assert_eq!(assignment.variant_id, case.variant_id);
        assert_eq!(assignment.assignment_reason, case.assignment_reason);
        assert_eq!(
            assignment.variant_config,
            experiment.variant(&case.variant_id).unwrap().prompt_config
        );
        println!("ok");
    }
}

#[test]
fn assignment_is_stable_across_engines() {
    let experiments = experiments();
    let cases = assignment_cases();

    // Fresh engines share no cache; agreement comes from hashing alone.
    let first = AssignmentEngine::new(&EngineConfig::default().with_assignment_consistency(false));
    let second = AssignmentEngine::new(&EngineConfig::default().with_assignment_consistency(false));

    for case in &cases {
        let experiment = &experiments[&case.experiment_id];
        let a = first.assign(experiment, &case.context);
        let b = second.assign(experiment, &case.context);
        assert_eq!(a.variant_id, b.variant_id);
        assert_eq!(a.assignment_reason, b.assignment_reason);
        assert_ne!(a.id, b.id, "every computed assignment gets a fresh id");
    }
}

#[test]
fn statistics_test_data() {
    let _ = env_logger::builder().is_test(true).try_init();

    let results: Vec<ExperimentResult> =
        serde_json::from_reader(File::open("tests/data/results.json").unwrap()).unwrap();

    let batch = StatisticsEngine::new().calculate_batch(&results);
    assert_eq!(batch.len(), 3);

    let checkout = batch["checkout-uniform"].as_ref().unwrap();
    assert_eq!(checkout.experiment_stats.control_variant_id, "control");
    assert_eq!(checkout.experiment_stats.total_sample_size, 7430);
    assert!(checkout.experiment_stats.all_significant);
    assert_eq!(
        checkout.experiment_stats.winner_variant_id.as_deref(),
        Some("concise")
    );
    let concise = checkout.variant("concise").unwrap();
    assert_eq!((concise.sample_size, concise.conversions), (2470, 416));
    assert!(concise.standard_deviation.is_some());
    let comparison = concise.comparison.as_ref().unwrap();
    assert!((comparison.z_test.z_score - 5.119_25).abs() < 1e-4);
    assert!((comparison.relative_difference - 43.215).abs() < 1e-3);

    let tone = batch["tone-weighted"].as_ref().unwrap();
    assert!(!tone.experiment_stats.all_significant);
    assert!(!tone.experiment_stats.winner_determined);
    assert!(tone.variant("neutral").unwrap().standard_deviation.is_none());

    let plan = batch["plan-split"].as_ref().unwrap_err();
    assert_eq!(plan.experiment_id.as_deref(), Some("plan-split"));
}
