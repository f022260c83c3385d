use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use surge_core::{
    Error, IterationError, JsonReporter, MetricKind, MetricValue, RunOptions, Runner, Stage,
    scenario_fn,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[tokio::test(start_paused = true)]
async fn hold_stage_runs_checks_and_passes_thresholds() -> anyhow::Result<()> {
    init_tracing();
    let options = RunOptions::ramping(vec![Stage::hold(Duration::from_secs(5), 3)])
        .with_scenario("browse")
        .with_tag("env", "ci")
        .with_threshold("checks{check:ok}", "rate==1")
        .with_threshold("iteration_duration", "p(95)<200");

    let summary = Runner::new(&options)?
        .run(scenario_fn(|ctx| {
            Box::pin(async move {
                ctx.sleep(ms(50)).await;
                ctx.check(&(), &[("ok", &|_: &()| true)]);
                Ok(())
            })
        }))
        .await?;

    assert!(summary.passed);
    assert!(!summary.aborted);
    assert_eq!(summary.abort_reason, None);
    assert_eq!(summary.scenario, "browse");
    assert_eq!(summary.tags.get("env").map(String::as_str), Some("ci"));
    assert_eq!(summary.vus_peak, 3);
    assert_eq!(summary.vus_used, 3);
    assert_eq!(summary.vu_reports.len(), 3);
    assert!(summary.iterations >= 270, "iterations: {}", summary.iterations);
    assert_eq!(summary.iterations_failed, 0);
    assert!(summary.elapsed >= Duration::from_secs(5));

    let Some(MetricValue::Counter { value }) = summary.metric("iterations", &[]) else {
        anyhow::bail!("iterations counter missing");
    };
    assert_eq!(*value, summary.iterations);
    assert!(summary.thresholds.iter().all(|t| !t.failed_during_run));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn failing_threshold_still_produces_a_summary() -> anyhow::Result<()> {
    let options = RunOptions {
        vus: Some(2),
        iterations: Some(20),
        ..RunOptions::default()
    }
    .with_threshold("iteration_failed", "rate<0.1");

    let seen = Arc::new(AtomicU64::new(0));
    let counter = seen.clone();
    let summary = Runner::new(&options)?
        .run(scenario_fn(move |ctx| {
            let n = counter.fetch_add(1, Ordering::Relaxed);
            Box::pin(async move {
                ctx.sleep(ms(10)).await;
                if n % 2 == 1 {
                    return Err(IterationError::msg("odd iteration"));
                }
                Ok(())
            })
        }))
        .await?;

    assert!(!summary.passed);
    assert!(!summary.aborted);
    assert_eq!(summary.iterations, 20);
    assert_eq!(summary.iterations_failed, 10);
    assert_eq!(seen.load(Ordering::Relaxed), 20);

    let verdict = summary
        .threshold("iteration_failed")
        .ok_or_else(|| anyhow::anyhow!("verdict missing"))?;
    assert_eq!(verdict.observed, Some(0.5));
    assert!(!verdict.passed);
    assert_eq!(summary.failed_thresholds().count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn abort_on_fail_stops_the_run_after_the_grace_period() -> anyhow::Result<()> {
    init_tracing();
    let options = RunOptions::ramping(vec![Stage::hold(Duration::from_secs(60), 2)])
        .with_abort_threshold("iteration_failed", "rate<0.1", Some(Duration::from_secs(2)))
        .with_threshold_interval(Duration::from_secs(1));

    let summary = Runner::new(&options)?
        .run(scenario_fn(|ctx| {
            Box::pin(async move {
                ctx.sleep(ms(100)).await;
                Err(IterationError::msg("always fails"))
            })
        }))
        .await?;

    assert!(summary.aborted);
    assert!(!summary.passed);
    assert_eq!(
        summary.abort_reason.as_deref(),
        Some("iteration_failed: rate<0.1")
    );
    assert!(summary.elapsed >= Duration::from_secs(2));
    assert!(summary.elapsed < Duration::from_secs(3), "{:?}", summary.elapsed);
    let verdict = &summary.thresholds[0];
    assert!(verdict.abort_on_fail);
    assert!(verdict.failed_during_run);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn external_stop_drains_and_reports() -> anyhow::Result<()> {
    let options = RunOptions::constant(4, Duration::from_secs(30));
    let runner = Runner::new(&options)?;
    let stop = runner.stop_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        stop.cancel();
    });

    let summary = runner
        .run(scenario_fn(|ctx| {
            Box::pin(async move {
                ctx.sleep(ms(200)).await;
                Ok(())
            })
        }))
        .await?;

    assert!(summary.aborted);
    assert_eq!(summary.abort_reason.as_deref(), Some("stopped externally"));
    // No thresholds means nothing can fail.
    assert!(summary.passed);
    assert!(summary.elapsed < Duration::from_secs(2));
    assert_eq!(summary.vu_reports.len(), 4);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn custom_metrics_feed_thresholds_and_the_json_report() -> anyhow::Result<()> {
    let options = RunOptions {
        vus: Some(1),
        iterations: Some(4),
        ..RunOptions::default()
    }
    .with_metric("cart_value", MetricKind::Trend)
    .with_threshold("cart_value", "max<100")
    .with_threshold("cart_value{group:::checkout}", "count==4");

    let mut out = tempfile::NamedTempFile::new()?;
    let runner = Runner::new(&options)?.with_reporter(JsonReporter::new(out.reopen()?));

    let summary = runner
        .run(scenario_fn(|ctx| {
            Box::pin(async move {
                let value = 10.0 * (ctx.iteration() + 1) as f64;
                ctx.group("checkout", move |ctx| {
                    Box::pin(async move {
                        ctx.trend("cart_value")?.add(value);
                        Ok::<_, IterationError>(())
                    })
                })
                .await
            })
        }))
        .await?;
    out.flush()?;

    assert!(summary.passed, "{:?}", summary.thresholds);
    assert_eq!(summary.threshold("cart_value").and_then(|t| t.observed), Some(40.0));

    let raw = std::fs::read_to_string(out.path())?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    assert_eq!(doc["passed"], true);
    assert_eq!(doc["iterations"], 4);
    assert!(
        doc["metrics"]
            .as_array()
            .is_some_and(|m| m.iter().any(|s| s["name"] == "cart_value"))
    );
    Ok(())
}

#[test]
fn configuration_faults_surface_before_the_run() {
    let conflicting = RunOptions::constant(1, Duration::from_secs(1))
        .with_metric("http_reqs", MetricKind::Trend);
    match Runner::new(&conflicting) {
        Err(err @ Error::Metrics(_)) => assert!(err.is_config()),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("conflicting metric kind accepted"),
    }

    let mismatched = RunOptions::constant(1, Duration::from_secs(1))
        .with_threshold("http_reqs", "p(95)<10");
    assert!(matches!(
        Runner::new(&mismatched),
        Err(Error::InvalidThreshold { .. })
    ));

    let zero = RunOptions::constant(0, Duration::from_secs(1));
    assert!(matches!(Runner::new(&zero), Err(Error::InvalidVus)));
}

#[tokio::test(start_paused = true)]
async fn options_load_from_a_yaml_file() -> anyhow::Result<()> {
    let mut file = tempfile::Builder::new().suffix(".yaml").tempfile()?;
    write!(
        file,
        r#"
scenario: from-file
stages:
  - duration: 2s
    target: 2
    mode: hold
thresholds:
  iterations: ["count>0"]
"#
    )?;
    file.flush()?;

    let options = RunOptions::from_path(file.path())?;
    let summary = Runner::new(&options)?
        .run(scenario_fn(|ctx| {
            Box::pin(async move {
                ctx.sleep(ms(100)).await;
                Ok(())
            })
        }))
        .await?;

    assert_eq!(summary.scenario, "from-file");
    assert_eq!(summary.vus_peak, 2);
    assert!(summary.passed);
    Ok(())
}
