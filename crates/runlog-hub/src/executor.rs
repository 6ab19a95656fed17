use crate::config::ExecutorKind;
use runlog_core::frame::{
    encode_frame, DispatchPayload, ExecutorFrame, NdjsonFrameDecoder, CURRENT_PROTOCOL_VERSION,
    DEFAULT_MAX_FRAME_BYTES,
};
use runlog_core::{Message, NewMessage, Originator};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const SIGNAL_BUFFER: usize = 64;
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub thread_id: String,
    pub messages: Vec<Message>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Interrupted,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorSignal {
    Message(NewMessage),
    Finished(RunOutcome),
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to spawn executor {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("executor process is missing its {0} pipe")]
    MissingPipe(&'static str),
}

/// Produces messages for a thread. Cancellation arrives on `cancel`; the
/// returned channel must end with exactly one `Finished` signal.
pub trait Executor: Send + Sync {
    fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ExecutorSignal>, ExecutorError>;
}

pub fn build_executor(kind: &ExecutorKind) -> Arc<dyn Executor> {
    match kind {
        ExecutorKind::Echo { delay } => Arc::new(EchoExecutor::new(*delay)),
        ExecutorKind::Command { program, args } => {
            Arc::new(CommandExecutor::new(program.clone(), args.clone()))
        }
    }
}

/// Resolves once cancellation is requested. Never resolves if the claim
/// holding the sender is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Replies to the latest end-user turn with a single orchestrator message.
pub struct EchoExecutor {
    delay: Duration,
}

impl EchoExecutor {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Executor for EchoExecutor {
    fn dispatch(
        &self,
        request: DispatchRequest,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ExecutorSignal>, ExecutorError> {
        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let delay = self.delay;
        tokio::spawn(async move {
            let prompt = request
                .messages
                .iter()
                .rev()
                .find(|message| message.originator.is_end_user())
                .map(|message| match message.content_text() {
                    Some(text) => text.to_string(),
                    None => message.content.to_string(),
                })
                .unwrap_or_default();

            let outcome = tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let reply =
                        NewMessage::new(Originator::Orchestrator, format!("echo: {prompt}"));
                    if tx.send(ExecutorSignal::Message(reply)).await.is_err() {
                        return;
                    }
                    RunOutcome::Done
                }
                _ = cancelled(&mut cancel) => RunOutcome::Interrupted,
            };
            let _ = tx.send(ExecutorSignal::Finished(outcome)).await;
        });
        Ok(rx)
    }
}

/// Runs an external program per dispatch and speaks NDJSON frames with it.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    max_frame_bytes: usize,
}

impl CommandExecutor {
    pub fn new(program: String, args: Vec<String>) -> Self {
        Self {
            program,
            args,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl Executor for CommandExecutor {
    fn dispatch(
        &self,
        request: DispatchRequest,
        cancel: watch::Receiver<bool>,
    ) -> Result<mpsc::Receiver<ExecutorSignal>, ExecutorError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        let stdin = child.stdin.take().ok_or(ExecutorError::MissingPipe("stdin"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ExecutorError::MissingPipe("stdout"))?;
        info!(
            event = "executor_spawned",
            program = %self.program,
            thread_id = %request.thread_id,
            pid = child.id().unwrap_or_default()
        );

        let (tx, rx) = mpsc::channel(SIGNAL_BUFFER);
        let session = CommandSession {
            child,
            stdin,
            stdout,
            cancel,
            tx,
            max_frame_bytes: self.max_frame_bytes,
        };
        tokio::spawn(session.run(request));
        Ok(rx)
    }
}

struct CommandSession {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
    cancel: watch::Receiver<bool>,
    tx: mpsc::Sender<ExecutorSignal>,
    max_frame_bytes: usize,
}

impl CommandSession {
    async fn run(mut self, request: DispatchRequest) {
        let outcome = self.exchange(request).await;
        // Already-exited children make this a no-op.
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
        if let Some(outcome) = outcome {
            let _ = self.tx.send(ExecutorSignal::Finished(outcome)).await;
        }
    }

    /// Returns the outcome to report, or `None` once the receiver is gone.
    async fn exchange(&mut self, request: DispatchRequest) -> Option<RunOutcome> {
        let dispatch = ExecutorFrame::Dispatch(DispatchPayload {
            version: CURRENT_PROTOCOL_VERSION,
            thread_id: request.thread_id,
            messages: request.messages,
        });
        if let Err(detail) = self.write_frame(&dispatch).await {
            return Some(RunOutcome::Error(detail));
        }

        let mut decoder = NdjsonFrameDecoder::<ExecutorFrame>::new(self.max_frame_bytes);
        let mut buf = vec![0u8; 8192];
        let mut interrupt_deadline: Option<Instant> = None;
        loop {
            let read = tokio::select! {
                read = self.stdout.read(&mut buf) => read,
                _ = cancelled(&mut self.cancel), if interrupt_deadline.is_none() => {
                    debug!(event = "executor_interrupt_sent");
                    let _ = self.write_frame(&ExecutorFrame::Interrupt).await;
                    interrupt_deadline = Some(Instant::now() + INTERRUPT_GRACE);
                    continue;
                }
                _ = tokio::time::sleep_until(interrupt_deadline.unwrap_or_else(Instant::now)),
                    if interrupt_deadline.is_some() => {
                    warn!(event = "executor_interrupt_timeout");
                    return Some(RunOutcome::Interrupted);
                }
            };

            let report = match read {
                Ok(0) => decoder.finish(),
                Ok(count) => decoder.push_chunk(&buf[..count]),
                Err(err) => return Some(RunOutcome::Error(format!("executor read failed: {err}"))),
            };
            for err in report.errors {
                warn!(event = "executor_frame_error", error = %err);
            }
            for frame in report.frames {
                match self.forward(frame).await {
                    Forwarded::Continue => {}
                    Forwarded::Finished(outcome) => return Some(outcome),
                    Forwarded::ReceiverGone => return None,
                }
            }
            if matches!(read, Ok(0)) {
                return Some(if interrupt_deadline.is_some() {
                    RunOutcome::Interrupted
                } else {
                    RunOutcome::Error("executor exited without a terminal frame".to_string())
                });
            }
        }
    }

    async fn forward(&mut self, frame: ExecutorFrame) -> Forwarded {
        let signal = match frame {
            ExecutorFrame::Message(message) => ExecutorSignal::Message(message),
            ExecutorFrame::Done => return Forwarded::Finished(RunOutcome::Done),
            ExecutorFrame::Interrupted => return Forwarded::Finished(RunOutcome::Interrupted),
            ExecutorFrame::Error(payload) => {
                return Forwarded::Finished(RunOutcome::Error(payload.message))
            }
            ExecutorFrame::Dispatch(_) | ExecutorFrame::Interrupt => {
                warn!(event = "executor_frame_ignored");
                return Forwarded::Continue;
            }
        };
        if self.tx.send(signal).await.is_err() {
            return Forwarded::ReceiverGone;
        }
        Forwarded::Continue
    }

    async fn write_frame(&mut self, frame: &ExecutorFrame) -> Result<(), String> {
        let bytes = encode_frame(frame, self.max_frame_bytes).map_err(|err| err.to_string())?;
        self.stdin
            .write_all(&bytes)
            .await
            .map_err(|err| format!("executor write failed: {err}"))?;
        self.stdin
            .flush()
            .await
            .map_err(|err| format!("executor write failed: {err}"))
    }
}

enum Forwarded {
    Continue,
    Finished(RunOutcome),
    ReceiverGone,
}
