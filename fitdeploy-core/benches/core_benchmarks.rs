use criterion::{Criterion, black_box, criterion_group, criterion_main};
use fitdeploy_core::codec::ContentType;
use fitdeploy_core::metrics::{
    MetricExtractor, classification_definitions, metric_line, regression_definitions,
};
use fitdeploy_core::serving::{LinearHooks, ServingContainer};
use serde_json::{Value, json};

fn batch(rows: usize) -> Value {
    Value::Array(
        (0..rows)
            .map(|i| json!({"x": i as f64 * 0.5, "y": i % 7, "has_darwin": i % 2 == 0}))
            .collect(),
    )
}

fn bench_codecs(c: &mut Criterion) {
    let payload = batch(1000);
    let csv = ContentType::Csv.encode(&payload).unwrap();
    let json = ContentType::Json.encode(&payload).unwrap();

    c.bench_function("csv_encode_1000_rows", |b| {
        b.iter(|| ContentType::Csv.encode(black_box(&payload)))
    });
    c.bench_function("csv_decode_1000_rows", |b| {
        b.iter(|| ContentType::Csv.decode(black_box(&csv)))
    });
    c.bench_function("json_decode_1000_rows", |b| {
        b.iter(|| ContentType::Json.decode(black_box(&json)))
    });
}

fn bench_metric_extraction(c: &mut Criterion) {
    let mut log = String::new();
    for epoch in 0..500 {
        log.push_str(&format!("fold {epoch}: fitting estimator\n"));
        log.push_str(&metric_line("RMSE", 1.0 / (epoch + 1) as f64));
        log.push('\n');
    }
    let regression = MetricExtractor::new(&regression_definitions()).unwrap();
    let classification = MetricExtractor::new(&classification_definitions()).unwrap();

    c.bench_function("extract_regression_metrics", |b| {
        b.iter(|| regression.extract(black_box(&log)))
    });
    c.bench_function("extract_classification_metrics_absent", |b| {
        b.iter(|| classification.extract(black_box(&log)))
    });
}

fn bench_serving(c: &mut Criterion) {
    let artifact = br#"{"intercept": 0.1, "coefficients": {"x": 1.5, "y": -0.2, "has_darwin": 0.7}}"#;
    let container = ServingContainer::from_artifact(LinearHooks, artifact).unwrap();
    let body = serde_json::to_vec(&batch(200)).unwrap();

    c.bench_function("serve_200_records_json_to_csv", |b| {
        b.iter(|| container.handle(black_box(&body), "application/json", "text/csv"))
    });
}

criterion_group!(benches, bench_codecs, bench_metric_extraction, bench_serving);
criterion_main!(benches);
