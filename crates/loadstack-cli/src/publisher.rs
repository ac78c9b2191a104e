//! Image build, registry authentication, push and repository release.
//!
//! Push is the only automatically retried operation in the whole run. Each
//! attempt re-authenticates first when the registry login is older than the
//! configured maximum age or the previous attempt was rejected for
//! authorization.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use loadstack_common::process::Termination;
use loadstack_common::retry::{retry_with_backoff, RetryConfig};
use loadstack_common::{Error, Invocation, ProcessOutput, Result};

use crate::context::Context;

const AUTH_FAILURE_MARKERS: [&str; 5] = [
    "authorization token has expired",
    "no basic auth credentials",
    "unauthorized: authentication required",
    "401 unauthorized",
    "your authorization token",
];

const TRANSIENT_MARKERS: [&str; 14] = [
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "broken pipe",
    "tls handshake",
    "unexpected eof",
    "temporary failure",
    "too many requests",
    "500 internal server error",
    "502 bad gateway",
    "503 service unavailable",
    "504 gateway",
    "net/http",
];

/// A locally built image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// `name:tag`
    pub reference: String,
    /// Content ID reported by `docker image inspect`
    pub id: String,
}

/// An image in the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Repository URL
    pub repository: String,
    /// Tag
    pub tag: String,
    /// Manifest digest, when the push output reported one
    pub digest: Option<String>,
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)?;
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}

/// Registry host of a repository URL (`<acct>.dkr.ecr.<region>.amazonaws.com`)
pub fn registry_host(repository_url: &str) -> &str {
    repository_url
        .split_once('/')
        .map(|(host, _)| host)
        .unwrap_or(repository_url)
}

/// Repository name of a repository URL (everything after the host)
pub fn repository_name(repository_url: &str) -> Option<&str> {
    repository_url
        .split_once('/')
        .map(|(_, name)| name)
        .filter(|n| !n.is_empty())
}

/// Digest from `docker push` output (`latest: digest: sha256:... size: 1234`)
pub fn parse_push_digest(output: &str) -> Option<String> {
    output.lines().find_map(|line| {
        let (_, rest) = line.split_once("digest: ")?;
        let digest = rest.split_whitespace().next()?;
        digest.starts_with("sha256:").then(|| digest.to_string())
    })
}

fn is_auth_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    AUTH_FAILURE_MARKERS.iter().any(|m| lower.contains(m))
}

fn is_transient_failure(text: &str) -> bool {
    let lower = text.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

#[derive(Debug, Default)]
struct AuthState {
    last_login: Option<Instant>,
    rejected: bool,
}

/// Builds and publishes the Locust image
pub struct Publisher<'a> {
    ctx: &'a Context,
    auth: Mutex<AuthState>,
}

impl<'a> Publisher<'a> {
    /// Create a publisher for `ctx`
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            ctx,
            auth: Mutex::new(AuthState::default()),
        }
    }

    fn max_auth_age(&self) -> Duration {
        Duration::from_secs(self.ctx.config.image.auth_max_age_secs)
    }

    fn needs_auth(&self) -> bool {
        let auth = match self.auth.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        auth.rejected
            || auth
                .last_login
                .map(|at| at.elapsed() >= self.max_auth_age())
                .unwrap_or(true)
    }

    fn record_auth(&self, login: Option<Instant>, rejected: bool) {
        let mut auth = match self.auth.lock() {
            Ok(a) => a,
            Err(poisoned) => poisoned.into_inner(),
        };
        if login.is_some() {
            auth.last_login = login;
        }
        auth.rejected = rejected;
    }

    /// Classify a failed registry interaction
    fn failure(&self, stage: &str, out: &ProcessOutput) -> Error {
        match out.termination {
            Termination::Cancelled => return Error::cancelled(format!("docker {}", stage)),
            Termination::TimedOut => {
                return Error::transient(stage, "attempt exceeded its deadline")
            }
            _ => {}
        }
        let text = out.combined();
        if is_auth_failure(&text) {
            self.record_auth(None, true);
            return Error::transient(
                stage,
                format!("registry rejected credentials: {}", out.error_tail()),
            );
        }
        if is_transient_failure(&text) {
            return Error::transient(stage, out.error_tail());
        }
        Error::publishing(stage, out.error_tail())
    }

    /// Log docker in to the registry with a fresh ECR token.
    pub async fn authenticate(&self, repository_url: &str) -> Result<()> {
        let host = registry_host(repository_url);
        info!(registry = %host, "Authenticating to registry...");

        let token_inv = self
            .ctx
            .aws()
            .args(["ecr", "get-login-password", "--region"])
            .arg(self.ctx.region.clone())
            .sensitive_output();
        let token = self.ctx.run(&token_inv).await?;
        if !token.success() {
            return Err(self.failure("authenticate", &token));
        }
        let password = token.stdout.trim();
        if password.is_empty() {
            return Err(Error::contract_violation(
                "aws ecr get-login-password",
                "returned an empty token",
            ));
        }

        let login_inv = Invocation::new("docker")
            .args(["login", "--username", "AWS", "--password-stdin", host])
            .stdin(password);
        let login = self.ctx.run(&login_inv).await?;
        if !login.success() {
            return Err(self.failure("authenticate", &login));
        }

        self.record_auth(Some(Instant::now()), false);
        Ok(())
    }

    /// Build the image from the configured Dockerfile and resolve its ID.
    ///
    /// Build failures are final; they are never retried.
    pub async fn build(&self, tag: &str) -> Result<LocalImage> {
        let image = &self.ctx.config.image;
        let reference = format!("{}:{}", self.ctx.config.local_image_name(), tag);
        info!(image = %reference, "Building image...");

        let inv = Invocation::new("docker")
            .arg("build")
            .arg("-f")
            .arg(image.dockerfile.display().to_string())
            .arg("-t")
            .arg(reference.clone())
            .arg(image.context.display().to_string())
            .maybe_deadline(self.ctx.config.deadlines.build())
            .streamed();
        let out = self.ctx.run(&inv).await?;
        match out.termination {
            Termination::Exited(0) => {}
            Termination::Cancelled => return Err(Error::cancelled("docker build")),
            _ => return Err(Error::publishing("docker build", out.error_tail())),
        }

        let inspect = Invocation::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}"])
            .arg(reference.clone());
        let out = self.ctx.run_checked(&inspect).await?;
        let id = out.stdout.trim().to_string();
        if id.is_empty() {
            return Err(Error::contract_violation(
                "docker image inspect",
                format!("no image ID for {}", reference),
            ));
        }
        debug!(image = %reference, id = %id, "Built image");
        Ok(LocalImage { reference, id })
    }

    async fn push_once(&self, remote: &str, attempt: u32) -> Result<Option<String>> {
        if self.needs_auth() {
            self.authenticate(remote).await?;
        }
        info!(image = %remote, attempt, "Pushing image...");
        let inv = Invocation::new("docker")
            .args(["push", remote])
            .maybe_deadline(self.ctx.config.deadlines.push())
            .streamed();
        let out = self.ctx.run(&inv).await?;
        if !out.success() {
            return Err(self.failure("docker push", &out));
        }
        Ok(parse_push_digest(&out.stdout))
    }

    /// Tag `local` into the registry and push it with bounded retries.
    pub async fn push(
        &self,
        local: &LocalImage,
        repository_url: &str,
        tag: &str,
    ) -> Result<ImageReference> {
        let remote = format!("{}:{}", repository_url, tag);
        let tag_inv =
            Invocation::new("docker").args(["tag", local.reference.as_str(), remote.as_str()]);
        let out = self.ctx.run(&tag_inv).await?;
        if !out.success() {
            return Err(Error::publishing("docker tag", out.error_tail()));
        }

        let retry = RetryConfig::with_max_attempts(self.ctx.config.image.push_attempts);
        let remote_ref = remote.as_str();
        let digest = retry_with_backoff(&retry, "docker push", &self.ctx.cancel, move |attempt| {
            self.push_once(remote_ref, attempt)
        })
        .await
        .map_err(|e| match e {
            Error::Transient { message, .. } => Error::publishing(
                "docker push",
                format!("gave up after {} attempts: {}", retry.max_attempts, message),
            ),
            other => other,
        })?;

        let reference = ImageReference {
            repository: repository_url.to_string(),
            tag: tag.to_string(),
            digest,
        };
        info!(image = %reference, "Image published");
        Ok(reference)
    }

    /// Delete the registry repository and every image in it.
    ///
    /// A repository that no longer exists counts as released.
    pub async fn release(&self, repository_url: &str) -> Result<()> {
        let name = repository_name(repository_url).ok_or_else(|| {
            Error::contract_violation(
                "registry_url",
                format!("'{}' has no repository name", repository_url),
            )
        })?;
        info!(repository = %name, "Deleting image repository...");
        let inv = self.ctx.aws().args([
            "ecr",
            "delete-repository",
            "--repository-name",
            name,
            "--force",
            "--output",
            "json",
        ]);
        let out = self.ctx.run(&inv).await?;
        if out.success() {
            return Ok(());
        }
        if out.combined().contains("RepositoryNotFoundException") {
            info!(repository = %name, "Repository already gone");
            return Ok(());
        }
        match out.termination {
            Termination::Cancelled => Err(Error::cancelled("aws ecr delete-repository")),
            _ => Err(Error::publishing("release", out.error_tail())),
        }
    }
}
