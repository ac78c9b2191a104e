//! `loadstack plan <ENVIRONMENT>`

use clap::Args;

use loadstack_common::Result;

use super::{finish, prepare, GlobalArgs};
use crate::pipeline::{Mode, Pipeline};
use crate::report::render_pipeline;

/// Validate prerequisites and write the infrastructure change plan for review
#[derive(Args, Debug)]
pub struct PlanArgs {
    /// Target environment
    pub environment: String,
}

pub async fn run(global: &GlobalArgs, args: PlanArgs) -> Result<u8> {
    let ctx = prepare(global, &args.environment)?;
    let report = Pipeline::new(&ctx, Mode::PlanOnly).run().await;
    Ok(finish(&ctx, &report, &render_pipeline(&report), report.exit_code()))
}
