//! Sample workflows driven by the CLI.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::process::Command;
use tracing::{debug, info};

use cadence_core::{CadenceError, Context, Step, StepRef, Transition};
use cadence_engine::{every, wrap};

/// Receives each line a workflow reports.
pub type Sink = Arc<dyn Fn(String) + Send + Sync>;

/// Counts from zero to `to`, one number per tick. The counter travels by
/// value: every tick hands a fresh step to the driver.
struct Count {
    current: u64,
    to: u64,
    sink: Sink,
}

impl Step for Count {
    fn run(self: Arc<Self>, _ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            (self.sink)(self.current.to_string());
            if self.current >= self.to {
                (self.sink)("end".to_string());
                return Transition::End;
            }
            Transition::next(Count {
                current: self.current + 1,
                to: self.to,
                sink: self.sink.clone(),
            })
        })
    }

    fn name(&self) -> &'static str {
        "Count"
    }
}

struct Start {
    to: u64,
    sink: Sink,
}

impl Step for Start {
    fn run(self: Arc<Self>, _ctx: Context) -> BoxFuture<'static, Transition> {
        Box::pin(async move {
            (self.sink)("start".to_string());
            Transition::next(Count {
                current: 0,
                to: self.to,
                sink: self.sink.clone(),
            })
        })
    }

    fn name(&self) -> &'static str {
        "Start"
    }
}

/// The counting workflow: `start 0 1 .. to end`, optionally pausing
/// `interval` before every number.
pub fn count_to(to: u64, interval: Option<Duration>, sink: Sink) -> StepRef {
    let start: StepRef = Arc::new(Start { to, sink });
    match interval {
        Some(interval) if !interval.is_zero() => every(interval, start),
        _ => start,
    }
}

/// Run `command` through `sh -c`. A non-zero exit status is a step failure;
/// cancelling the context kills the child.
pub fn shell(command: Vec<String>) -> StepRef {
    let line = Arc::new(command.join(" "));
    wrap(move |ctx: Context| {
        let line = line.clone();
        async move { run_shell(&ctx, &line).await }
    })
}

async fn run_shell(ctx: &Context, line: &str) -> Result<(), CadenceError> {
    debug!(command = %line, "Spawning shell command");
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(line)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .spawn()?;

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = ctx.cancelled() => {
            let _ = child.kill().await;
            return Err(ctx.cause().unwrap_or(CadenceError::Cancelled));
        }
    };

    if status.success() {
        info!(command = %line, "Command succeeded");
        Ok(())
    } else {
        Err(CadenceError::Step(format!("command '{}' exited with {}", line, status)))
    }
}
