//! `loadstack deploy <ENVIRONMENT> <IMAGE_TAG>`

use clap::Args;

use loadstack_common::{Error, Result};

use super::{finish, prepare, GlobalArgs};
use crate::pipeline::{Mode, Pipeline};
use crate::report::render_pipeline;

/// Provision the environment, publish the image and deploy Locust
#[derive(Args, Debug)]
pub struct DeployArgs {
    /// Target environment (selects `<config-dir>/<environment>.yaml` and its tfvars)
    pub environment: String,

    /// Tag for the Locust image
    pub image_tag: String,
}

/// Docker's tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
pub fn validate_image_tag(tag: &str) -> Result<()> {
    let mut chars = tag.chars();
    let valid = tag.len() <= 128
        && matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(Error::configuration(format!(
            "invalid image tag '{}': use letters, digits, '_', '.' and '-' (max 128, not starting with '.' or '-')",
            tag
        )));
    }
    Ok(())
}

pub async fn run(global: &GlobalArgs, args: DeployArgs) -> Result<u8> {
    validate_image_tag(&args.image_tag)?;
    let ctx = prepare(global, &args.environment)?;

    let report = Pipeline::new(
        &ctx,
        Mode::Deploy {
            image_tag: args.image_tag,
        },
    )
    .run()
    .await;
    Ok(finish(&ctx, &report, &render_pipeline(&report), report.exit_code()))
}
