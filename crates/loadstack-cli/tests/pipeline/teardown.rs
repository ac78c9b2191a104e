use loadstack_cli::commands::teardown::execute;
use loadstack_cli::teardown::{StepOutcome, TeardownStep};
use loadstack_common::session::WarningKind;
use loadstack_common::testing::{ok, ScriptedRunner};
use std::sync::Arc;

use crate::fixtures::{healthy_runner, network_interfaces, Answers, Inputs};

#[tokio::test(start_paused = true)]
async fn lingering_interfaces_do_not_block_destroy() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    runner.on("aws", &["ec2", "describe-network-interfaces"], ok(&network_interfaces(true)));
    let ctx = inputs.context(runner.clone(), "teardown-1");

    let report = execute(&ctx, &Answers::new(&[]), true).await.unwrap().unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.state, TeardownStep::Done);
    assert!(matches!(
        report.outcome(TeardownStep::WaitForNetworkInterfaceRelease),
        Some(StepOutcome::Overridden { .. })
    ));
    assert!(report
        .warnings
        .iter()
        .any(|w| w.kind == WarningKind::TeardownOrderingTimeout && w.message.contains("eni-0lb")));

    let calls = runner.calls();
    let last_eni = calls
        .iter()
        .rposition(|c| c.contains("describe-network-interfaces"))
        .unwrap();
    let destroy = runner.position("terraform destroy").unwrap();
    assert!(destroy > last_eni, "{:?}", calls);
    assert!(runner.position("kubectl delete service locust-master").unwrap() < last_eni);
}

#[tokio::test]
async fn denied_confirmation_makes_no_external_calls() {
    let inputs = Inputs::new();
    for answers in [&["no"][..], &["yes", "prod"][..], &[][..]] {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = inputs.context(runner.clone(), "denied");

        let report = execute(&ctx, &Answers::new(answers), false).await.unwrap();

        assert!(report.is_none());
        assert!(runner.calls().is_empty(), "{:?}", runner.calls());
    }
}

#[tokio::test(start_paused = true)]
async fn confirmed_teardown_checks_prerequisites_first() {
    let inputs = Inputs::new();
    let runner = healthy_runner();
    let ctx = inputs.context(runner.clone(), "teardown-1");

    let report = execute(&ctx, &Answers::new(&["yes", "dev"]), false)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(runner.calls()[0], "which terraform");
    let identity = runner.position("aws sts get-caller-identity").unwrap();
    assert!(identity < runner.position("terraform init").unwrap());
    assert_eq!(runner.count("docker"), 0);
    let release = runner.position("aws ecr delete-repository").unwrap();
    assert!(release > runner.position("terraform destroy").unwrap());
}
