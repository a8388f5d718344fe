use approx::assert_abs_diff_eq;
use ndarray::{Array1, Array2, array};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use ratecard::fit::model::ComparisonDefaults;
use ratecard::fit::reduced::ReducedModel;
use ratecard::prepare::table::ApplicantTable;
use ratecard::serve::service::{Comparison, Prediction, RateService};
use ratecard::serve::similarity::SimilarityIndex;

const FEATURES: [&str; 4] = ["term", "all_util", "bc_util", "bc_open_to_buy"];
const TRUE_INTERCEPT: f64 = 4.0;
const TRUE_COEFFICIENTS: [f64; 4] = [0.12, 0.04, 0.025, -0.00015];

fn feature_names() -> Vec<String> {
    FEATURES.iter().map(|f| f.to_string()).collect()
}

fn synthetic_table(rows: usize, noise_sd: f64, seed: u64) -> ApplicantTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let noise = Normal::new(0.0, noise_sd).unwrap();
    let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(rows); FEATURES.len()];
    let mut target = Vec::with_capacity(rows);
    for _ in 0..rows {
        let row = [
            if rng.gen_bool(0.6) { 36.0 } else { 60.0 },
            rng.gen_range(0.0..100.0),
            rng.gen_range(0.0..100.0),
            rng.gen_range(0.0..30_000.0),
        ];
        let rate = TRUE_INTERCEPT
            + row
                .iter()
                .zip(TRUE_COEFFICIENTS)
                .map(|(x, b)| x * b)
                .sum::<f64>()
            + noise.sample(&mut rng);
        for (column, value) in columns.iter_mut().zip(row) {
            column.push(Some(value));
        }
        target.push(rate);
    }

    let mut table = ApplicantTable::new("interest_rate", target);
    for (name, values) in FEATURES.iter().zip(columns) {
        table = table.with_numeric(name, values).unwrap();
    }
    table
}

#[test]
fn reduced_model_recovers_known_coefficients() {
    let table = synthetic_table(1000, 0.01, 11);
    let model = ReducedModel::fit(&table, &feature_names()).unwrap();

    let (intercept, coefficients) = model.model.raw_coefficients();
    assert_abs_diff_eq!(intercept, TRUE_INTERCEPT, epsilon = 0.01);
    for (fitted, expected) in coefficients.iter().zip(TRUE_COEFFICIENTS) {
        assert_abs_diff_eq!(fitted.coefficient, expected, epsilon = 1e-4);
    }

    let metrics = model.evaluate(&synthetic_table(200, 0.01, 12)).unwrap();
    assert!(metrics.rmse < 0.02, "rmse = {}", metrics.rmse);
    assert!(metrics.r_squared > 0.999);
}

#[test]
fn same_term_records_are_the_nearest_neighbours() {
    let features = vec!["term".to_string(), "all_util".to_string()];
    let index = SimilarityIndex::from_rows(
        "interest_rate",
        &features,
        array![[36.0, 0.5], [36.0, 0.52], [60.0, 0.9]],
        Array1::from(vec![10.0, 11.0, 18.0]),
    )
    .unwrap();

    let neighbourhood = index.query(&[36.0, 0.5], 3).unwrap();
    let rows: Vec<usize> = neighbourhood.members.iter().map(|n| n.row).collect();
    assert_eq!(rows, vec![0, 1, 2]);
    assert!(neighbourhood.members[1].distance < neighbourhood.members[2].distance);
}

#[test]
fn service_answers_predictions_and_comparisons_together() {
    let table = synthetic_table(300, 0.3, 21);
    let features = feature_names();
    let model = ReducedModel::fit(&table, &features).unwrap();
    let (x, y): (Array2<f64>, Array1<f64>) = table.design_matrix(&features).unwrap();
    let index = SimilarityIndex::from_rows("interest_rate", &features, x, y).unwrap();
    let service = RateService::new(
        model,
        index,
        ComparisonDefaults {
            k: 25,
            bin_width: 0.25,
        },
    )
    .unwrap();

    let vector = service
        .parse_form(&[
            ("term", " 60 months"),
            ("all_util", "70"),
            ("bc_util", "35.5%"),
            ("bc_open_to_buy", "12000"),
        ])
        .unwrap();

    let expected = 4.0 + 0.12 * 60.0 + 0.04 * 70.0 + 0.025 * 35.5 - 0.00015 * 12_000.0;
    match service.predict(&vector) {
        Prediction::Available { predicted_rate } => {
            assert_abs_diff_eq!(predicted_rate, expected, epsilon = 0.2)
        }
        other => panic!("Expected a prediction, got {:?}", other),
    }

    let first = match service.compare(&vector, None) {
        Comparison::Available(histogram) => histogram,
        other => panic!("Expected a histogram, got {:?}", other),
    };
    assert!(first.total() >= 25);
    assert_eq!(first.bin_width, 0.25);
    assert_eq!(service.compare(&vector, None), Comparison::Available(first));
    assert_eq!(service.cached_comparisons(), 1);

    assert!(matches!(
        service.compare(&vector, Some(0)),
        Comparison::Unavailable { .. }
    ));
}
