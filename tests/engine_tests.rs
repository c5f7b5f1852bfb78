
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobrelay::dispatch::{AssignOutcome, Assignment};
use jobrelay::worker::engine::image_name;
use jobrelay::worker::{CompletionReport, EnginePhase, ExecutionEngine};
use test_harness::{wait_for, FakeContainerEngine, FakeRecipeSource, FakeReporter};

const RECIPE_URL: &str = "http://recipes.local/hello.Dockerfile";
const RECIPE: &str = "FROM alpine:3.19\nCMD [\"echo\", \"hello\"]\n";

struct Fixture {
    engine: Arc<ExecutionEngine>,
    recipes: Arc<FakeRecipeSource>,
    containers: Arc<FakeContainerEngine>,
    reporter: Arc<FakeReporter>,
}

fn fixture() -> Fixture {
    let recipes = FakeRecipeSource::new();
    recipes.serve(RECIPE_URL, RECIPE);
    let containers = FakeContainerEngine::new();
    let reporter = FakeReporter::new();
    let engine = Arc::new(ExecutionEngine::new(
        "w1",
        recipes.clone(),
        containers.clone(),
        reporter.clone(),
    ));
    Fixture {
        engine,
        recipes,
        containers,
        reporter,
    }
}

/// The report sent for `job_id`
fn report(f: &Fixture, job_id: &str) -> CompletionReport {
    f.reporter
        .reports()
        .into_iter()
        .find(|r| r.job_id == job_id)
        .expect("no report for job")
}

fn assignment(job_id: &str, task: &str) -> Assignment {
    Assignment {
        job_id: job_id.to_string(),
        task: task.to_string(),
        scheduled_at: Utc::now(),
    }
}

async fn run_to_completion(f: &Fixture, job_id: &str, task: &str) {
    let outcome = f.engine.try_accept(assignment(job_id, task)).await;
    assert_eq!(outcome, AssignOutcome::Accepted);
    tokio::time::timeout(Duration::from_secs(5), f.engine.wait_idle())
        .await
        .expect("job did not finish");
}

#[tokio::test]
async fn test_successful_job_builds_runs_and_reports() {
    let f = fixture();
    run_to_completion(&f, "j1", RECIPE_URL).await;

    assert_eq!(f.recipes.fetched(), vec![RECIPE_URL.to_string()]);
    let builds = f.containers.builds.lock().unwrap().clone();
    assert_eq!(builds, vec![("job-image-j1".to_string(), RECIPE.to_string())]);
    assert_eq!(*f.containers.runs.lock().unwrap(), vec!["job-image-j1".to_string()]);
    assert_eq!(*f.containers.removed.lock().unwrap(), vec!["job-image-j1".to_string()]);

    let reports = f.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].success);
    assert!(reports[0].error.is_empty());
    assert_eq!(reports[0].job_id, "j1");
    assert_eq!(reports[0].worker_id, "w1");

    assert_eq!(f.engine.phase(), EnginePhase::Idle);
    assert!(!f.engine.is_busy().await);
}

#[tokio::test]
async fn test_fetch_failure_records_error_and_frees_worker() {
    let f = fixture();
    run_to_completion(&f, "j1", "http://recipes.local/missing").await;

    let failed = report(&f, "j1");
    assert!(!failed.success);
    assert!(failed.error.starts_with("fetch failed"));
    assert!(failed.error.contains("404"));
    assert!(f.containers.built_images().is_empty());

    // selectable again
    assert_eq!(f.engine.phase(), EnginePhase::Idle);
    assert!(f.engine.is_accepting().await);
    run_to_completion(&f, "j2", RECIPE_URL).await;
    assert!(report(&f, "j2").success);
}

#[tokio::test]
async fn test_build_failure_skips_run() {
    let f = fixture();
    f.containers.fail_build("exit code: Some(1): unknown instruction");
    run_to_completion(&f, "j1", RECIPE_URL).await;

    let failed = report(&f, "j1");
    assert!(!failed.success);
    assert!(failed.error.starts_with("build failed"));
    assert!(f.containers.runs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_run_failure_still_removes_image() {
    let f = fixture();
    f.containers.fail_run("exit code: Some(3)");
    run_to_completion(&f, "j1", RECIPE_URL).await;

    assert!(report(&f, "j1").error.starts_with("run failed"));
    assert_eq!(*f.containers.removed.lock().unwrap(), vec!["job-image-j1".to_string()]);
}

#[tokio::test]
async fn test_malformed_payload_fails_at_fetch_stage() {
    let f = fixture();
    run_to_completion(&f, "j1", "{\"not_a_recipe\": true}").await;

    assert!(report(&f, "j1").error.starts_with("fetch failed"));
    assert!(f.recipes.fetched().is_empty());
}

#[tokio::test]
async fn test_json_task_document_is_accepted() {
    let f = fixture();
    let task = format!("{{\"recipe_url\": \"{}\"}}", RECIPE_URL);
    run_to_completion(&f, "j1", &task).await;

    assert!(report(&f, "j1").success);
}

#[tokio::test]
async fn test_busy_engine_rejects_second_job() {
    let f = fixture();
    f.containers.set_run_delay(Duration::from_millis(200));

    assert_eq!(
        f.engine.try_accept(assignment("j1", RECIPE_URL)).await,
        AssignOutcome::Accepted
    );
    match f.engine.try_accept(assignment("j2", RECIPE_URL)).await {
        AssignOutcome::Rejected(reason) => assert!(reason.contains("j1")),
        AssignOutcome::Accepted => panic!("second job accepted while busy"),
    }
    assert_eq!(f.engine.current_job().await.as_deref(), Some("j1"));

    f.engine.wait_idle().await;
    let reports = f.reporter.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].job_id, "j1");
}

#[tokio::test]
async fn test_current_assignment_carries_payload_until_done() {
    let f = fixture();
    f.containers.set_run_delay(Duration::from_millis(200));
    let sent = assignment("j1", RECIPE_URL);
    f.engine.try_accept(sent.clone()).await;

    let held = f.engine.current_assignment().await.unwrap();
    assert_eq!(held.job_id, "j1");
    assert_eq!(held.task, RECIPE_URL);
    assert_eq!(held.scheduled_at, sent.scheduled_at);

    f.engine.wait_idle().await;
    assert!(f.engine.current_assignment().await.is_none());
}

#[tokio::test]
async fn test_phase_reaches_running() {
    let f = fixture();
    f.containers.set_run_delay(Duration::from_millis(200));
    f.engine.try_accept(assignment("j1", RECIPE_URL)).await;

    let engine = f.engine.clone();
    let running = wait_for(Duration::from_secs(2), || {
        let engine = engine.clone();
        async move { engine.phase() == EnginePhase::Running }
    })
    .await;
    assert!(running);
    f.engine.wait_idle().await;
}

#[tokio::test]
async fn test_drain_rejects_new_jobs_but_finishes_current() {
    let f = fixture();
    f.containers.set_run_delay(Duration::from_millis(100));
    f.engine.try_accept(assignment("j1", RECIPE_URL)).await;

    f.engine.begin_drain().await;
    f.engine.wait_idle().await;

    assert!(report(&f, "j1").success);
    assert_eq!(f.reporter.reports().len(), 1);
    assert!(!f.engine.is_accepting().await);
    assert!(matches!(
        f.engine.try_accept(assignment("j2", RECIPE_URL)).await,
        AssignOutcome::Rejected(_)
    ));
}

#[tokio::test]
async fn test_missing_scratch_dir_is_fatal() {
    let recipes = FakeRecipeSource::new();
    recipes.serve(RECIPE_URL, RECIPE);
    let reporter = FakeReporter::new();
    let engine = Arc::new(
        ExecutionEngine::new(
            "w1",
            recipes,
            FakeContainerEngine::new(),
            reporter.clone(),
        )
        .with_scratch_dir("/nonexistent/jobrelay-scratch"),
    );

    engine.try_accept(assignment("j1", RECIPE_URL)).await;
    engine.wait_idle().await;

    let reports = reporter.reports();
    assert_eq!(reports.len(), 1);
    assert!(!reports[0].success);
    assert!(reports[0].error.starts_with("build context unavailable"));
    assert!(engine.fatal_token().is_cancelled());
    assert!(!engine.is_accepting().await);
}

#[test]
fn test_image_names_are_stable_per_job() {
    assert_eq!(image_name("j1"), "job-image-j1");
    assert_ne!(image_name("Build#1"), image_name("build-1"));
}
