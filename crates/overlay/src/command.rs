// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command execution seam for OVS and iproute2.
//!
//! All overlay work reduces to `ovs-vsctl`, `ip`, `nsenter`, and
//! container-runtime invocations. Routing them through a trait keeps
//! the convergence logic testable without a real switch.

use async_trait::async_trait;
use std::process::Stdio;

/// Captured result of one command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self { code: 0, stdout: stdout.into(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self { code, stdout: String::new(), stderr: stderr.into() }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion, capturing output. A non-zero exit
    /// code is a normal [`CommandOutput`], not an `Err`; `Err` means the
    /// process could not be spawned at all.
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput>;
}

/// Real command runner over tokio processes.
#[derive(Default)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A recorded invocation: program plus full argument list.
#[cfg(any(test, feature = "test-support"))]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

#[cfg(any(test, feature = "test-support"))]
impl Invocation {
    /// The invocation rendered as a single command line, for matching.
    pub fn line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Scripted command runner: every command succeeds with empty output
/// unless a response is scripted for a command-line prefix.
#[cfg(any(test, feature = "test-support"))]
#[derive(Default)]
pub struct FakeCommandRunner {
    invocations: parking_lot::Mutex<Vec<Invocation>>,
    responses: parking_lot::Mutex<Vec<(String, CommandOutput)>>,
}

#[cfg(any(test, feature = "test-support"))]
impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the response for any command line starting with `prefix`.
    /// Later entries win over earlier ones.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.responses.lock().push((prefix.to_string(), output));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().clone()
    }

    /// Recorded command lines containing `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.invocations
            .lock()
            .iter()
            .map(Invocation::line)
            .filter(|l| l.contains(needle))
            .collect()
    }
}

#[cfg(any(test, feature = "test-support"))]
#[async_trait]
impl CommandRunner for FakeCommandRunner {
    async fn run(&self, program: &str, args: &[&str]) -> std::io::Result<CommandOutput> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        let line = invocation.line();
        self.invocations.lock().push(invocation);

        let responses = self.responses.lock();
        for (prefix, output) in responses.iter().rev() {
            if line.starts_with(prefix) {
                return Ok(output.clone());
            }
        }
        Ok(CommandOutput::ok(""))
    }
}
