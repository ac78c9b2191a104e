//! Scripted process runner for tests
//!
//! [`ScriptedRunner`] answers invocations from a table of rules and records
//! every call so tests can assert on ordering. Rules match on the program and
//! a leading slice of the arguments; the longest matching prefix wins, and
//! later rules win ties so a test can override a default. A rule with several
//! replies returns them in order and then keeps repeating the last one.
//! Anything unscripted exits 127. Programs marked [`ScriptedRunner::uninstalled`]
//! fail to spawn.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::process::{Invocation, ProcessOutput, ProcessRunner, Termination};
use crate::{Error, Result};

/// Successful output with the given stdout
pub fn ok(stdout: &str) -> ProcessOutput {
    ProcessOutput {
        termination: Termination::Exited(0),
        stdout: stdout.to_string(),
        stderr: String::new(),
        elapsed: Duration::from_millis(1),
    }
}

/// Failed output with the given exit code and stderr
pub fn fail(code: i32, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        termination: Termination::Exited(code),
        stdout: String::new(),
        stderr: stderr.to_string(),
        elapsed: Duration::from_millis(1),
    }
}

struct Rule {
    program: String,
    prefix: Vec<String>,
    replies: VecDeque<ProcessOutput>,
    last: ProcessOutput,
}

impl Rule {
    fn matches(&self, invocation: &Invocation) -> bool {
        invocation.program() == self.program
            && invocation.arg_list().len() >= self.prefix.len()
            && invocation
                .arg_list()
                .iter()
                .zip(&self.prefix)
                .all(|(arg, want)| arg == want)
    }

    fn next_reply(&mut self) -> ProcessOutput {
        match self.replies.pop_front() {
            Some(reply) => {
                self.last = reply.clone();
                reply
            }
            None => self.last.clone(),
        }
    }
}

/// [`ProcessRunner`] that replays scripted outputs and records calls
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<Invocation>>,
    uninstalled: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    /// Create a runner with no rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `program prefix...` with `reply` every time
    pub fn on(&self, program: &str, prefix: &[&str], reply: ProcessOutput) -> &Self {
        self.on_sequence(program, prefix, vec![reply])
    }

    /// Answer `program prefix...` with `replies` in order, repeating the last
    pub fn on_sequence(
        &self,
        program: &str,
        prefix: &[&str],
        replies: Vec<ProcessOutput>,
    ) -> &Self {
        let mut replies: VecDeque<ProcessOutput> = replies.into();
        let last = replies.back().cloned().unwrap_or_else(|| ok(""));
        if replies.len() == 1 {
            replies.clear();
        }
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                program: program.to_string(),
                prefix: prefix.iter().map(|s| s.to_string()).collect(),
                replies,
                last,
            });
        }
        self
    }

    /// Make every invocation of `program` fail to spawn
    pub fn uninstalled(&self, program: &str) -> &Self {
        if let Ok(mut uninstalled) = self.uninstalled.lock() {
            uninstalled.push(program.to_string());
        }
        self
    }

    /// Every invocation seen so far
    pub fn invocations(&self) -> Vec<Invocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Command lines of every invocation seen so far
    pub fn calls(&self) -> Vec<String> {
        self.invocations().iter().map(Invocation::display).collect()
    }

    /// Index of the first call whose command line starts with `needle`
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(needle))
    }

    /// Number of calls whose command line starts with `needle`
    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(needle)).count()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(
        &self,
        invocation: &Invocation,
        cancel: &CancellationToken,
    ) -> Result<ProcessOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }
        if cancel.is_cancelled() {
            return Ok(ProcessOutput {
                termination: Termination::Cancelled,
                ..ok("")
            });
        }

        let missing = self
            .uninstalled
            .lock()
            .map(|u| u.iter().any(|p| p == invocation.program()))
            .unwrap_or(false);
        if missing {
            return Err(Error::Spawn {
                program: invocation.program().to_string(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        let mut rules = match self.rules.lock() {
            Ok(rules) => rules,
            Err(poisoned) => poisoned.into_inner(),
        };
        let best = rules
            .iter_mut()
            .enumerate()
            .filter(|(_, r)| r.matches(invocation))
            .max_by_key(|(i, r)| (r.prefix.len(), *i))
            .map(|(_, r)| r);

        Ok(match best {
            Some(rule) => rule.next_reply(),
            None => fail(127, &format!("unscripted command: {}", invocation.display())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn longest_prefix_wins_and_calls_are_recorded() {
        let runner = ScriptedRunner::new();
        runner.on("terraform", &[], ok("generic"));
        runner.on("terraform", &["output", "-json"], ok("{}"));

        let cancel = CancellationToken::new();
        let out = runner
            .run(&Invocation::new("terraform").args(["output", "-json"]), &cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, "{}");

        let out = runner
            .run(&Invocation::new("terraform").arg("init"), &cancel)
            .await
            .unwrap();
        assert_eq!(out.stdout, "generic");

        assert_eq!(runner.calls(), ["terraform output -json", "terraform init"]);
        assert_eq!(runner.position("terraform init"), Some(1));
    }

    #[tokio::test]
    async fn sequence_repeats_last_reply() {
        let runner = ScriptedRunner::new();
        runner.on_sequence("kubectl", &["get"], vec![fail(1, "x"), ok("a")]);
        let cancel = CancellationToken::new();
        let inv = Invocation::new("kubectl").arg("get");

        assert!(!runner.run(&inv, &cancel).await.unwrap().success());
        assert_eq!(runner.run(&inv, &cancel).await.unwrap().stdout, "a");
        assert_eq!(runner.run(&inv, &cancel).await.unwrap().stdout, "a");
    }

    #[tokio::test]
    async fn unscripted_commands_exit_127() {
        let runner = ScriptedRunner::new();
        let out = runner
            .run(&Invocation::new("docker").arg("info"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code(), Some(127));
    }
}
