use loadstack_cli::pipeline::{Mode, Pipeline};
use loadstack_common::handles::{
    CLUSTER_NAME, IMAGE_REFERENCE, LOCUST_UI_ENDPOINT, REGISTRY_URL, VPC_ID,
};
use loadstack_common::session::{PhaseName, PhaseStatus, WarningKind};
use loadstack_common::testing::{fail, ok};
use loadstack_common::ErrorClass;

use crate::fixtures::{deployment, healthy_runner, Inputs, LOCK_ERROR, REGISTRY};

fn deploy_abc123() -> Mode {
    Mode::Deploy {
        image_tag: "abc123".to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn deploy_dev_abc123_succeeds() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    let ctx = inputs.context(runner.clone(), "run-1");

    let report = Pipeline::new(&ctx, deploy_abc123()).run().await;

    assert_eq!(report.exit_code(), 0, "{:?}", report.failure);
    let session = &report.session;
    let statuses: Vec<_> = session.phases.iter().map(|p| (p.name, p.status)).collect();
    assert_eq!(
        statuses,
        PhaseName::FORWARD
            .iter()
            .map(|p| (*p, PhaseStatus::Succeeded))
            .collect::<Vec<_>>()
    );

    let handles = session.handles.summary();
    assert_eq!(handles.get(CLUSTER_NAME).map(String::as_str), Some("loadstack-dev"));
    assert_eq!(handles.get(REGISTRY_URL).map(String::as_str), Some(REGISTRY));
    assert!(handles[IMAGE_REFERENCE].starts_with(&format!("{}:abc123@sha256:", REGISTRY)));
    assert_eq!(
        handles.get(LOCUST_UI_ENDPOINT).map(String::as_str),
        Some("http://k8s-locust.elb.us-east-1.amazonaws.com:8089")
    );

    let handles_json = std::fs::read_to_string(ctx.workspace.handles_json()).unwrap();
    let written: serde_json::Value = serde_json::from_str(&handles_json).unwrap();
    assert_eq!(written["cluster_name"], "loadstack-dev");
    assert!(ctx.workspace.plan_json().is_file());

    let worker = std::fs::read_to_string(ctx.workspace.rendered_dir().join("worker.yaml")).unwrap();
    assert!(worker.contains(&format!("image: '{}", REGISTRY)));
    assert!(worker.contains("replicas: 3"));

    let order = [
        "aws sts get-caller-identity",
        "terraform apply",
        "aws eks update-kubeconfig",
        "docker build",
        "docker push",
        "kubectl apply -n",
    ];
    let positions: Vec<_> = order.iter().map(|c| runner.position(c).unwrap()).collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", runner.calls());
}

#[tokio::test(start_paused = true)]
async fn partial_worker_readiness_is_degraded_not_failed() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    runner.on(
        "kubectl",
        &["get", "deployment", "locust-worker"],
        ok(&deployment("locust-worker", 2)),
    );
    let ctx = inputs.context(runner, "run-1");

    let report = Pipeline::new(&ctx, deploy_abc123()).run().await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.session.status(PhaseName::Deploy), Some(PhaseStatus::Degraded));
    let warning = report
        .session
        .warnings
        .iter()
        .find(|w| w.kind == WarningKind::DegradedReadiness)
        .unwrap();
    assert!(warning.message.contains("deployment/locust-worker: 2/3 ready"));
    assert!(warning.follow_up.as_deref().unwrap().contains("kubectl"));
}

#[tokio::test(start_paused = true)]
async fn rerun_after_provisioning_failure_converges() {
    let inputs = Inputs::new();

    let clean = Pipeline::new(&inputs.context(healthy_runner(), "clean"), deploy_abc123())
        .run()
        .await;
    assert_eq!(clean.exit_code(), 0);

    let flaky = healthy_runner();
    flaky.on_sequence(
        "terraform",
        &["apply"],
        vec![
            fail(1, "Error: waiting for EKS Node Group create: unexpected state 'CREATE_FAILED'"),
            ok("Apply complete! Resources: 1 added."),
        ],
    );

    let first = Pipeline::new(&inputs.context(flaky.clone(), "attempt-1"), deploy_abc123())
        .run()
        .await;
    assert_eq!(first.exit_code(), ErrorClass::Provisioning.exit_code());
    assert_eq!(first.session.status(PhaseName::Provision), Some(PhaseStatus::Failed));
    assert_eq!(first.session.status(PhaseName::Deploy), Some(PhaseStatus::Skipped));
    assert_eq!(flaky.count("docker build"), 0);

    let second = Pipeline::new(&inputs.context(flaky, "attempt-2"), deploy_abc123())
        .run()
        .await;
    assert_eq!(second.exit_code(), 0);
    assert_eq!(second.session.handles.summary(), clean.session.handles.summary());
    assert!(second.session.handles.get(VPC_ID).is_some());
}

#[tokio::test(start_paused = true)]
async fn lock_contention_suggests_force_unlock() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    runner.on("terraform", &["plan"], fail(1, LOCK_ERROR));
    let ctx = inputs.context(runner.clone(), "run-1");

    let report = Pipeline::new(&ctx, deploy_abc123()).run().await;

    assert_eq!(report.exit_code(), 4);
    let failure = report.failure.unwrap();
    assert_eq!(failure.phase, "provision");
    assert_eq!(failure.class, ErrorClass::LockContention);
    assert!(failure
        .next_command
        .unwrap()
        .ends_with("force-unlock 0d7c5a1e-1111-2222-3333-444455556666"));
    assert_eq!(runner.count("terraform apply"), 0);
}

#[tokio::test]
async fn plan_only_never_applies() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    let ctx = inputs.context(runner.clone(), "run-1");

    let report = Pipeline::new(&ctx, Mode::PlanOnly).run().await;

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.change_summary.unwrap().create, 3);
    assert_eq!(runner.count("terraform apply"), 0);
    assert_eq!(runner.count("kubectl"), 0);
    assert!(runner
        .calls()
        .iter()
        .any(|c| c.contains("-backend-config=key=loadstack/dev/terraform.tfstate")));
}
