//! The monitoring task, behind a trait so the loop does not care how records are found.
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use tokio::process::Command;

/// What one probe attempt found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing new.
    Idle,
    /// A record was accepted; its description goes to the operator.
    Record(String),
}

/// Errors produced by a probe attempt. All are treated as transient.
#[derive(Debug)]
pub enum ProbeError {
    Spawn(std::io::Error),
    Failed { code: Option<i32>, stderr: String },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Spawn(e) => write!(f, "failed to run probe: {e}"),
            ProbeError::Failed { code, stderr } => match code {
                Some(code) => write!(f, "probe exited with {code}: {stderr}"),
                None => write!(f, "probe killed by signal: {stderr}"),
            },
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn(e) => Some(e),
            ProbeError::Failed { .. } => None,
        }
    }
}

pub type ProbeFuture<'a> = Pin<Box<dyn Future<Output = Result<ProbeOutcome, ProbeError>> + Send + 'a>>;

pub trait Probe: Send + Sync {
    fn poll(&self) -> ProbeFuture<'_>;
}

/// Runs an external command once per attempt.
///
/// The command inherits the worker's environment and process group, so the
/// supervisor's group kill reaches it. Exit 0 with output is a record, exit
/// 0 without output is idle, anything else is a transient failure.
pub struct CommandProbe {
    program: String,
    args: Vec<String>,
}

impl CommandProbe {
    /// `argv[0]` is the program. Returns None for an empty command line.
    pub fn new(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

impl Probe for CommandProbe {
    fn poll(&self) -> ProbeFuture<'_> {
        Box::pin(async move {
            let output = Command::new(&self.program)
                .args(&self.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(ProbeError::Spawn)?;

            if !output.status.success() {
                return Err(ProbeError::Failed {
                    code: output.status.code(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                });
            }

            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if stdout.is_empty() {
                Ok(ProbeOutcome::Idle)
            } else {
                Ok(ProbeOutcome::Record(stdout))
            }
        })
    }
}
