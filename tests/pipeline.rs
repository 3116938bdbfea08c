use std::fs;
use std::path::Path;

use clap::Parser;

use cosmotion::config::Settings;
use cosmotion::data::DataError;
use cosmotion::export::{FACTORS_FILE, ITEMS_FILE, PROJECTED_FACTORS_FILE, SEARCH_RESULTS_FILE};
use cosmotion::pipeline::Pipeline;

fn settings(output_dir: &Path, extra: &[&str]) -> Settings {
    let output_dir = output_dir.to_str().unwrap();
    let mut args = vec![
        "cosmotion",
        "--output-dir",
        output_dir,
        "--seed",
        "7",
        "--factors",
        "2",
        "--iterations",
        "50",
        "--regularization",
        "0.01",
        "--learning-rates",
        "0.05",
    ];
    args.extend_from_slice(extra);

    Settings::try_parse_from(args).unwrap()
}

fn write(dir: &Path, name: &str, contents: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, contents).unwrap();
    path.to_str().unwrap().to_owned()
}

fn lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|x| x.to_owned())
        .collect()
}

#[test]
fn four_interactions_end_to_end() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let interactions = write(
        input.path(),
        "interactions.csv",
        "user,item,weight\nA,B,1\nB,A,1\nA,C,2\nC,A,2\n",
    );
    let labels = write(input.path(), "labels.csv", "address,label\nA,Alice\n");

    let config = settings(
        output.path(),
        &["--interactions", &interactions, "--labels", &labels],
    )
    .into_config()
    .unwrap();

    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.trials, 1);
    assert_eq!(summary.best_trial, 1);
    assert_eq!(summary.export.written, 3);

    let items = lines(&output.path().join(ITEMS_FILE));
    assert_eq!(items, vec!["label\taddress", "\tB", "Alice\tA", "\tC"]);

    let factors = lines(&output.path().join(FACTORS_FILE));
    assert_eq!(factors.len(), 3);
    for row in &factors {
        let values: Vec<f32> = row.split('\t').map(|x| x.parse().unwrap()).collect();
        assert_eq!(values.len(), 2);
        assert!(values.iter().all(|x| x.is_finite()));
    }

    let results: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(output.path().join(SEARCH_RESULTS_FILE)).unwrap())
            .unwrap();
    assert_eq!(results.as_array().unwrap().len(), 1);

    assert!(!output.path().join(PROJECTED_FACTORS_FILE).exists());
}

#[test]
fn zero_weight_aborts_before_training() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();
    let output_dir = output.path().join("out");

    let interactions = write(
        input.path(),
        "interactions.csv",
        "user,item,weight\nA,B,1\nB,A,0\nA,C,2\n",
    );

    let config = settings(&output_dir, &["--interactions", &interactions])
        .into_config()
        .unwrap();

    let err = Pipeline::new(config).run().unwrap_err();

    match err.downcast_ref::<DataError>() {
        Some(DataError::InvalidWeight { record, weight }) => {
            assert_eq!(*record, 1);
            assert_eq!(*weight, 0.0);
        }
        other => panic!("Unexpected error: {:?}", other),
    }

    assert!(!output_dir.exists());
}

#[test]
fn zero_weight_can_be_skipped() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let interactions = write(
        input.path(),
        "interactions.csv",
        "user,item,weight\nA,B,1\nB,A,0\nA,C,2\nC,A,2\n",
    );

    let config = settings(
        output.path(),
        &[
            "--interactions",
            &interactions,
            "--invalid-weights",
            "skip",
        ],
    )
    .into_config()
    .unwrap();

    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.build.rejected, 1);
    assert_eq!(summary.build.accepted, 3);
    // The skipped record creates no index entries: items are B, C, A.
    assert_eq!(
        lines(&output.path().join(ITEMS_FILE)),
        vec!["label\taddress", "\tB", "\tC", "\tA"]
    );
}

#[test]
fn activity_buckets_are_not_exported_and_rows_align() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let transfers = write(
        input.path(),
        "transfers.csv",
        "from,to,amount\na,b,5\nc,a,35\na,d,55\nb,c,10\n",
    );
    let activity = write(
        input.path(),
        "activity.csv",
        "account,timestamp\na,0\nb,100\nc,20000\nd,20001\na,40000\n",
    );
    let labels = write(input.path(), "labels.csv", "address,label\na,Alice\nd,  \n");

    let config = settings(
        output.path(),
        &[
            "--transfers",
            &transfers,
            "--activity",
            &activity,
            "--labels",
            &labels,
            "--project",
        ],
    )
    .into_config()
    .unwrap();

    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.build.real_items, 4);
    assert_eq!(summary.export.written, 4);
    assert_eq!(summary.export.synthetic, 3);

    let items = lines(&output.path().join(ITEMS_FILE));
    let factors = lines(&output.path().join(FACTORS_FILE));
    let projected = lines(&output.path().join(PROJECTED_FACTORS_FILE));

    assert_eq!(items.len() - 1, 4);
    assert_eq!(factors.len(), 4);
    assert_eq!(projected.len(), 4);
    assert!(items.iter().all(|x| !x.contains("bucket:")));
    assert!(items.contains(&"Alice\ta".to_owned()));
    assert!(projected.iter().all(|x| x.split('\t').count() == 3));
}

#[test]
fn labels_can_be_required() {
    let input = tempfile::tempdir().unwrap();
    let output = tempfile::tempdir().unwrap();

    let interactions = write(
        input.path(),
        "interactions.csv",
        "user,item\nA,B\nA,C\n",
    );
    let labels = write(input.path(), "labels.csv", "address,label\nA,Alice\nB,Bob\n");

    let config = settings(
        output.path(),
        &[
            "--interactions",
            &interactions,
            "--symmetric",
            "--labels",
            &labels,
            "--require-labels",
        ],
    )
    .into_config()
    .unwrap();

    let summary = Pipeline::new(config).run().unwrap();

    assert_eq!(summary.export.written, 2);
    assert_eq!(summary.export.unlabelled, 1);
    assert_eq!(
        lines(&output.path().join(ITEMS_FILE)),
        vec!["label\taddress", "Bob\tB", "Alice\tA"]
    );
}

#[test]
fn refit_retrains_the_winner_on_every_interaction() {
    let input = tempfile::tempdir().unwrap();
    let scored = tempfile::tempdir().unwrap();
    let refitted = tempfile::tempdir().unwrap();

    let mut contents = String::from("user,item\n");
    for user in 0..12 {
        let group = user / 6;
        for item in 0..4 {
            contents.push_str(&format!("u{},i{}\n", user, group * 4 + item));
        }
    }
    let interactions = write(input.path(), "interactions.csv", &contents);

    let run = |output: &Path, extra: &[&str]| {
        let mut args = vec!["--interactions", interactions.as_str(), "--holdout", "0.3"];
        args.extend_from_slice(extra);
        Pipeline::new(settings(output, &args).into_config().unwrap())
            .run()
            .unwrap()
    };

    let without = run(scored.path(), &[]);
    let with = run(refitted.path(), &["--refit"]);

    assert_eq!(with.trials, 1);
    assert_eq!(with.best_trial, without.best_trial);
    assert_eq!(with.best_score, without.best_score);
    assert_eq!(with.export.written, 8);

    assert_eq!(
        lines(&scored.path().join(ITEMS_FILE)),
        lines(&refitted.path().join(ITEMS_FILE))
    );

    let refitted_factors = lines(&refitted.path().join(FACTORS_FILE));
    assert_eq!(refitted_factors.len(), 8);
    assert_ne!(lines(&scored.path().join(FACTORS_FILE)), refitted_factors);
}
