//! `loadstack teardown <ENVIRONMENT> [--yes]`

use clap::Args;
use tracing::info;

use loadstack_common::{ErrorClass, HandleRegistry, Result, ASSUME_YES_ENV};

use super::{finish, prepare, GlobalArgs};
use crate::context::Context;
use crate::prerequisites::{PrerequisiteValidator, Purpose};
use crate::report::render_teardown;
use crate::teardown::{
    confirm_teardown, Confirmer, TeardownReport, TeardownSequencer, TerminalConfirmer,
};

/// Destroy every resource of an environment
#[derive(Args, Debug)]
pub struct TeardownArgs {
    /// Target environment
    pub environment: String,

    /// Skip both confirmation prompts
    #[arg(short = 'y', long, env = ASSUME_YES_ENV)]
    pub yes: bool,
}

/// Ask for confirmation, check prerequisites and run the sequencer.
///
/// Returns `None` when the operator declines; nothing external has run then.
pub async fn execute(
    ctx: &Context,
    confirmer: &dyn Confirmer,
    assume_yes: bool,
) -> Result<Option<TeardownReport>> {
    if !confirm_teardown(confirmer, &ctx.environment, assume_yes).await? {
        info!(environment = %ctx.environment, "Teardown declined");
        return Ok(None);
    }

    PrerequisiteValidator::new(ctx)
        .validate(Purpose::Teardown, &mut HandleRegistry::new())
        .await?;
    Ok(Some(TeardownSequencer::new(ctx).run().await))
}

pub async fn run(global: &GlobalArgs, args: TeardownArgs) -> Result<u8> {
    let ctx = prepare(global, &args.environment)?;
    match execute(&ctx, &TerminalConfirmer::new(), args.yes).await? {
        Some(report) => Ok(finish(
            &ctx,
            &report,
            &render_teardown(&report),
            report.exit_code(),
        )),
        None => {
            println!("Teardown of '{}' not confirmed; nothing was changed.", ctx.environment);
            Ok(ErrorClass::Cancelled.exit_code())
        }
    }
}
