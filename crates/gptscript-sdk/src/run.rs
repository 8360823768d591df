use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use gptscript_schema::{
    CallFrame, Frame, Options, Program, PromptFrame, RunEventType, RunState, Tool, ToolDef,
};
use serde_json::{Map, Value};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::decode::{decode_line, LineBuffer, StreamRecord};
use crate::error::{FailureKind, RunError};
use crate::handler::{Dispatcher, EventHandler};

/// Connect and idle-read limit for engine requests. A run may stream for
/// longer than this as long as the engine keeps sending. Runs are not retried.
pub const RUN_REQUEST_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Error text recorded when the engine answers with a failing HTTP status.
pub const GENERIC_RUN_ERROR: &str = "run encountered an error";
pub const ABORTED_MESSAGE: &str = "run was aborted";

/// HTTP client used for every engine request.
pub fn engine_http_client() -> Result<reqwest::Client, reqwest::Error> {
    engine_http_client_with_timeout(RUN_REQUEST_TIMEOUT)
}

pub(crate) fn engine_http_client_with_timeout(
    idle: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .connect_timeout(idle)
        .read_timeout(idle)
        .build()
}

#[derive(Debug, Clone, Default, PartialEq)]
/// What a run executes.
pub enum ToolPayload {
    /// Only the options are sent; the engine resolves the tool itself.
    #[default]
    None,
    /// A script file path or URL, sent as `file`.
    File(String),
    /// Inline tool definitions, sent as `toolDefs`. The first is the entry tool.
    Tools(Vec<Tool>),
}

impl ToolPayload {
    fn write_into(&self, body: &mut Map<String, Value>) -> Result<(), serde_json::Error> {
        match self {
            Self::None => {}
            Self::File(path) => {
                body.insert("file".to_string(), Value::String(path.clone()));
            }
            Self::Tools(tools) => {
                body.insert("toolDefs".to_string(), serde_json::to_value(tools)?);
            }
        }
        Ok(())
    }
}

impl From<ToolDef> for ToolPayload {
    fn from(def: ToolDef) -> Self {
        Self::Tools(vec![Tool::from(def)])
    }
}

impl From<Vec<ToolDef>> for ToolPayload {
    fn from(defs: Vec<ToolDef>) -> Self {
        Self::Tools(defs.into_iter().map(Tool::from).collect())
    }
}

impl From<Tool> for ToolPayload {
    fn from(tool: Tool) -> Self {
        Self::Tools(vec![tool])
    }
}

impl From<Vec<Tool>> for ToolPayload {
    fn from(tools: Vec<Tool>) -> Self {
        Self::Tools(tools)
    }
}

impl From<&str> for ToolPayload {
    fn from(path: &str) -> Self {
        Self::from(path.to_string())
    }
}

impl From<String> for ToolPayload {
    fn from(path: String) -> Self {
        if path.is_empty() {
            Self::None
        } else {
            Self::File(path)
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Point-in-time view of a run's accumulated state.
pub struct RunSnapshot {
    pub state: RunState,
    pub output: String,
    pub err_output: String,
    pub error: String,
    pub failure: Option<FailureKind>,
    pub chat_state: String,
    pub program: Option<Program>,
    pub calls: HashMap<String, CallFrame>,
    pub parent_call_id: String,
    /// Last structured `stdout` object, if any.
    pub raw_output: Option<Value>,
    pub aborted: bool,
}

#[derive(Debug, Default)]
struct AbortSignal {
    aborted: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    /// Returns `true` only for the call that set the flag.
    fn trigger(&self) -> bool {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.notify.notify_one();
        true
    }

    fn is_set(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn triggered(&self) {
        if self.is_set() {
            return;
        }
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone)]
/// Cheap handle to a running run, passed to event handlers.
pub struct RunHandle {
    progress: watch::Receiver<RunSnapshot>,
    abort: Arc<AbortSignal>,
}

impl RunHandle {
    /// Requests cancellation. Later calls are no-ops.
    pub fn cancel(&self) {
        if self.abort.trigger() {
            tracing::debug!("run cancellation requested");
        }
    }

    pub fn state(&self) -> RunState {
        self.progress.borrow().state
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.progress.borrow().clone()
    }
}

#[derive(Debug, Clone)]
enum RunKind {
    Chat,
    /// A single request/response engine command. `body` is sent as-is.
    Basic {
        body: Option<Value>,
    },
}

/// One turn of a tool execution or a single engine command.
///
/// A started run decodes the engine's event stream in a background task.
/// Accessors return snapshots of whatever has been decoded so far.
pub struct Run {
    request_path: String,
    tools: ToolPayload,
    options: Options,
    handlers: Vec<EventHandler>,
    kind: RunKind,
    http: reqwest::Client,
    progress_tx: Arc<watch::Sender<RunSnapshot>>,
    progress: watch::Receiver<RunSnapshot>,
    abort: Arc<AbortSignal>,
    task: Option<JoinHandle<()>>,
    started: bool,
}

impl Run {
    pub(crate) fn new(
        http: reqwest::Client,
        request_path: impl Into<String>,
        tools: ToolPayload,
        options: Options,
        handlers: Vec<EventHandler>,
    ) -> Self {
        Self::with_kind(http, request_path.into(), tools, options, handlers, RunKind::Chat)
    }

    pub(crate) fn basic(
        http: reqwest::Client,
        request_path: impl Into<String>,
        body: Option<Value>,
        url: &str,
        token: &str,
    ) -> Self {
        let mut options = Options::default();
        options.global.url = url.to_string();
        options.global.token = token.to_string();
        Self::with_kind(
            http,
            request_path.into(),
            ToolPayload::None,
            options,
            Vec::new(),
            RunKind::Basic { body },
        )
    }

    fn with_kind(
        http: reqwest::Client,
        request_path: String,
        tools: ToolPayload,
        options: Options,
        handlers: Vec<EventHandler>,
        kind: RunKind,
    ) -> Self {
        let (progress_tx, progress) = watch::channel(RunSnapshot::default());
        Self {
            request_path,
            tools,
            options,
            handlers,
            kind,
            http,
            progress_tx: Arc::new(progress_tx),
            progress,
            abort: Arc::new(AbortSignal::default()),
            task: None,
            started: false,
        }
    }

    /// Issues this run's request with `input` and returns it started.
    pub(crate) fn start(mut self, input: impl Into<String>) -> Result<Run, RunError> {
        if self.started {
            return Err(RunError::InvalidState(
                "run has already been started".to_string(),
            ));
        }
        self.options.input = input.into();
        let body = self.request_body()?;
        let url = format!(
            "{}/{}",
            self.options.global.url.trim_end_matches('/'),
            self.request_path
        );

        self.progress_tx
            .send_modify(|progress| progress.state = RunState::Running);
        self.started = true;

        let request = RunRequest {
            http: self.http.clone(),
            url,
            token: self.options.global.token.clone(),
            body,
            basic: matches!(self.kind, RunKind::Basic { .. }),
            prompt_allowed: self.options.prompt,
            progress: Arc::clone(&self.progress_tx),
            abort: Arc::clone(&self.abort),
            handlers: self.handlers.clone(),
            handle: self.handle(),
        };
        self.task = Some(tokio::spawn(request.execute()));
        Ok(self)
    }

    /// Starts the next chat turn with `input`.
    ///
    /// Valid from `Creating`, `Continue`, and `Error`. The returned run
    /// carries this run's chat state forward only when this run ended in
    /// `Continue`. Basic command runs cannot be continued.
    pub fn next_chat(&self, input: impl Into<String>) -> Result<Run, RunError> {
        let state = self.state();
        if matches!(self.kind, RunKind::Basic { .. }) {
            return Err(RunError::InvalidState(format!(
                "basic command runs cannot be continued (state {state})"
            )));
        }
        if !matches!(
            state,
            RunState::Creating | RunState::Continue | RunState::Error
        ) {
            return Err(RunError::InvalidState(format!(
                "run must be in creating, continue, or error state, not {state}"
            )));
        }
        self.successor().start(input)
    }

    fn successor(&self) -> Run {
        let mut options = self.options.clone();
        {
            let progress = self.progress.borrow();
            if progress.state == RunState::Continue {
                options.chat_state = progress.chat_state.clone();
            }
        }
        Run::with_kind(
            self.http.clone(),
            self.request_path.clone(),
            self.tools.clone(),
            options,
            self.handlers.clone(),
            self.kind.clone(),
        )
    }

    fn request_body(&self) -> Result<Option<Value>, RunError> {
        match &self.kind {
            RunKind::Basic { body } => Ok(body.clone()),
            RunKind::Chat => {
                let mut body = match serde_json::to_value(&self.options)? {
                    Value::Object(map) => map,
                    _ => Map::new(),
                };
                self.tools.write_into(&mut body)?;
                Ok(Some(Value::Object(body)))
            }
        }
    }

    /// Waits for the run to finish and returns its output.
    pub async fn text(&mut self) -> Result<String, RunError> {
        if !self.started {
            return Err(RunError::InvalidState(
                "run has not been started".to_string(),
            ));
        }
        if let Some(task) = self.task.take() {
            if let Err(error) = task.await {
                let aborted = self.abort.is_set();
                self.progress_tx.send_modify(|progress| {
                    progress.state = RunState::Error;
                    progress.aborted = aborted;
                    if aborted {
                        progress.failure = Some(FailureKind::Aborted);
                        progress.error = ABORTED_MESSAGE.to_string();
                    } else {
                        progress.failure = Some(FailureKind::Internal);
                        progress.error = format!("run task failed: {error}");
                    }
                });
            }
        }

        let progress = self.progress.borrow();
        if progress.failure == Some(FailureKind::Aborted) {
            return Err(RunError::Aborted {
                err_output: progress.err_output.clone(),
            });
        }
        if !progress.error.is_empty() {
            return Err(RunError::Failed {
                kind: progress.failure.unwrap_or(FailureKind::Engine),
                message: progress.error.clone(),
                err_output: progress.err_output.clone(),
            });
        }
        Ok(progress.output.clone())
    }

    /// Cancels an in-flight run. Cancelling again, or after the run
    /// completed, has no effect.
    pub fn cancel(&self) -> Result<(), RunError> {
        if !self.started {
            return Err(RunError::InvalidState(
                "run has not been started".to_string(),
            ));
        }
        self.handle().cancel();
        Ok(())
    }

    pub fn handle(&self) -> RunHandle {
        RunHandle {
            progress: self.progress.clone(),
            abort: Arc::clone(&self.abort),
        }
    }

    pub fn snapshot(&self) -> RunSnapshot {
        self.progress.borrow().clone()
    }

    pub fn state(&self) -> RunState {
        self.progress.borrow().state
    }

    pub fn output(&self) -> String {
        self.progress.borrow().output.clone()
    }

    pub fn err_output(&self) -> String {
        self.progress.borrow().err_output.clone()
    }

    pub fn error(&self) -> String {
        self.progress.borrow().error.clone()
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        self.progress.borrow().failure
    }

    pub fn chat_state(&self) -> String {
        self.progress.borrow().chat_state.clone()
    }

    pub fn program(&self) -> Option<Program> {
        self.progress.borrow().program.clone()
    }

    pub fn calls(&self) -> HashMap<String, CallFrame> {
        self.progress.borrow().calls.clone()
    }

    pub fn parent_call_id(&self) -> String {
        self.progress.borrow().parent_call_id.clone()
    }

    /// The root call, once its first frame arrived.
    pub fn parent_call_frame(&self) -> Option<CallFrame> {
        let progress = self.progress.borrow();
        progress.calls.get(&progress.parent_call_id).cloned()
    }

    pub fn was_aborted(&self) -> bool {
        self.progress.borrow().aborted
    }

    pub fn request_path(&self) -> &str {
        &self.request_path
    }

    /// Options the next turn is built from.
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut Options {
        &mut self.options
    }
}

struct Failure {
    kind: FailureKind,
    message: String,
}

impl Failure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn aborted() -> Self {
        Self::new(FailureKind::Aborted, ABORTED_MESSAGE)
    }
}

/// State moved into the background task of a started run.
struct RunRequest {
    http: reqwest::Client,
    url: String,
    token: String,
    body: Option<Value>,
    basic: bool,
    prompt_allowed: bool,
    progress: Arc<watch::Sender<RunSnapshot>>,
    abort: Arc<AbortSignal>,
    handlers: Vec<EventHandler>,
    handle: RunHandle,
}

impl RunRequest {
    async fn execute(self) {
        let dispatcher = Dispatcher::spawn(&self.handlers, self.handle.clone());
        let outcome = self.stream(&dispatcher).await;
        self.progress.send_modify(|progress| match outcome {
            Ok(done) => {
                progress.state = if !progress.error.is_empty() {
                    RunState::Error
                } else if done {
                    RunState::Finished
                } else {
                    RunState::Continue
                };
            }
            Err(failure) => {
                progress.aborted = failure.kind == FailureKind::Aborted;
                progress.failure = Some(failure.kind);
                progress.error = failure.message;
                progress.state = RunState::Error;
            }
        });
        tracing::debug!(
            url = %self.url,
            state = %self.progress.borrow().state,
            "run request finished"
        );
        dispatcher.finish().await;
    }

    /// Reads the response to the end. Returns the last `done` flag.
    async fn stream(&self, dispatcher: &Dispatcher) -> Result<bool, Failure> {
        let method = if self.body.is_some() { "POST" } else { "GET" };
        tracing::debug!(url = %self.url, method, "issuing run request");

        let mut request = match &self.body {
            Some(body) => self.http.post(&self.url).json(body),
            None => self.http.get(&self.url),
        };
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = tokio::select! {
            biased;
            _ = self.abort.triggered() => return Err(Failure::aborted()),
            response = request.send() => response.map_err(|error| {
                Failure::new(FailureKind::Transport, format!("failed to send run request: {error}"))
            })?,
        };

        let status = response.status().as_u16();
        let status_failed = !(200..400).contains(&status);
        if status_failed {
            tracing::debug!(url = %self.url, status, "engine returned a failing status");
        }

        // Basic commands and plain-text output never send a done flag.
        let mut done = true;
        let mut buffer = LineBuffer::default();
        let mut stream = response.bytes_stream();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = self.abort.triggered() => return Err(Failure::aborted()),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else {
                break;
            };
            let chunk = chunk.map_err(|error| {
                Failure::new(
                    FailureKind::Transport,
                    format!("failed to read run response: {error}"),
                )
            })?;
            let lines = buffer
                .push(&chunk)
                .map_err(|error| Failure::new(FailureKind::Protocol, error.to_string()))?;
            for line in lines {
                self.apply_line(&line, &mut done, status_failed, dispatcher)?;
            }
        }
        let tail = buffer
            .finish()
            .map_err(|error| Failure::new(FailureKind::Protocol, error.to_string()))?;
        if let Some(line) = tail {
            self.apply_line(&line, &mut done, status_failed, dispatcher)?;
        }

        if status_failed {
            return Err(Failure::new(FailureKind::HttpStatus, GENERIC_RUN_ERROR));
        }
        Ok(done)
    }

    fn apply_line(
        &self,
        line: &str,
        done: &mut bool,
        status_failed: bool,
        dispatcher: &Dispatcher,
    ) -> Result<(), Failure> {
        let record = match decode_line(line) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(error) if status_failed => {
                // Error bodies are often not records; keep them for the caller.
                tracing::debug!(error = %error, "undecodable line in failed response");
                self.progress
                    .send_modify(|progress| progress.err_output.push_str(line.trim()));
                return Ok(());
            }
            Err(error) => return Err(Failure::new(FailureKind::Protocol, error.to_string())),
        };

        match record {
            StreamRecord::Stdout(text) => {
                self.progress.send_modify(|progress| progress.output = text);
            }
            StreamRecord::StructuredStdout(value) if self.basic => {
                self.progress.send_modify(|progress| {
                    progress.output = value.to_string();
                    progress.raw_output = Some(value);
                });
            }
            StreamRecord::StructuredStdout(value) => {
                *done = value.get("done").and_then(Value::as_bool).unwrap_or(false);
                self.progress.send_modify(|progress| {
                    if let Some(state) = value.get("state") {
                        progress.chat_state = state.to_string();
                    }
                    if let Some(content) = value.get("content").and_then(Value::as_str) {
                        progress.output.push_str(content);
                    }
                    progress.raw_output = Some(value);
                });
            }
            StreamRecord::Stderr(text) => {
                self.progress
                    .send_modify(|progress| progress.err_output.push_str(&text));
            }
            StreamRecord::Event(frame) => {
                match &frame {
                    Frame::Prompt(prompt) if !self.prompt_allowed => {
                        tracing::debug!(prompt_id = %prompt.id, "prompt received on a run without prompting");
                        return Err(Failure::new(
                            FailureKind::PolicyViolation,
                            prompt_not_allowed_message(prompt),
                        ));
                    }
                    Frame::Prompt(_) => {}
                    Frame::Run(run) => self.progress.send_modify(|progress| {
                        match run.event_type {
                            RunEventType::RunStart => {
                                if let Some(program) = &run.program {
                                    progress.program = Some(program.clone());
                                }
                            }
                            RunEventType::RunFinish if !run.error.is_empty() => {
                                progress.error = run.error.clone();
                                progress.failure = Some(FailureKind::Engine);
                            }
                            _ => {}
                        }
                    }),
                    Frame::Call(call) => self.progress.send_modify(|progress| {
                        if progress.parent_call_id.is_empty() && call.is_root() {
                            progress.parent_call_id = call.id.clone();
                        }
                        progress.calls.insert(call.id.clone(), call.clone());
                    }),
                }
                dispatcher.dispatch(frame);
            }
        }
        Ok(())
    }
}

fn prompt_not_allowed_message(prompt: &PromptFrame) -> String {
    let fields = prompt
        .fields
        .iter()
        .map(|field| field.name.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "prompt occurred when prompt was not allowed: message: {}, fields: [{}], sensitive: {}",
        prompt.message, fields, prompt.sensitive
    )
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use gptscript_schema::{Options, RunState, ToolDef};
    use serde_json::{json, Value};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    use super::{engine_http_client_with_timeout, Run, ToolPayload};
    use crate::error::RunError;

    async fn read_request(socket: &mut TcpStream) {
        let mut raw = Vec::new();
        let mut chunk = [0_u8; 4096];
        loop {
            let read = socket.read(&mut chunk).await.expect("read request");
            if read == 0 {
                return;
            }
            raw.extend_from_slice(&chunk[..read]);
            if let Some(end) = raw.windows(4).position(|window| window == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&raw[..end]).to_ascii_lowercase();
                let length = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|value| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if raw.len() >= end + 4 + length {
                    return;
                }
            }
        }
    }

    /// Serves one request, writing each record after `gap` and keeping the
    /// connection open for `hold_open` afterwards.
    async fn spawn_paced_engine(
        records: Vec<Value>,
        gap: Duration,
        hold_open: Duration,
    ) -> (String, JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            read_request(&mut socket).await;
            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
                )
                .await
                .expect("write head");
            for record in records {
                tokio::time::sleep(gap).await;
                socket
                    .write_all(format!("data: {record}\n\n").as_bytes())
                    .await
                    .expect("write record");
                socket.flush().await.expect("flush");
            }
            tokio::time::sleep(hold_open).await;
        });
        (format!("http://{addr}"), server)
    }

    fn started_run(http: reqwest::Client, url: String) -> Run {
        let mut options = Options::default();
        options.global.url = url;
        Run::new(http, "evaluate", ToolDef::new("x").into(), options, Vec::new())
            .start("")
            .expect("start run")
    }

    fn chat_run(tools: ToolPayload, options: Options) -> Run {
        Run::new(reqwest::Client::new(), "evaluate", tools, options, Vec::new())
    }

    #[test]
    fn unit_tool_payload_from_empty_path_is_none() {
        assert_eq!(ToolPayload::from(""), ToolPayload::None);
        assert_eq!(
            ToolPayload::from("main.gpt"),
            ToolPayload::File("main.gpt".to_string())
        );
    }

    #[test]
    fn unit_chat_request_body_merges_options_and_tool_defs() {
        let mut options = Options {
            sub_tool: "other".to_string(),
            ..Options::default()
        };
        options.global.token = "secret".to_string();
        let run = chat_run(
            vec![ToolDef::new("echo hi"), ToolDef::new("second")].into(),
            options,
        );

        let body = run
            .request_body()
            .expect("build body")
            .expect("chat runs always send a body");
        assert_eq!(body["subTool"], "other");
        assert_eq!(body["toolDefs"][0]["instructions"], "echo hi");
        assert_eq!(body["toolDefs"][1]["instructions"], "second");
        assert!(body.get("token").is_none());
        assert!(body.get("file").is_none());
    }

    #[test]
    fn unit_file_payload_sends_file_field() {
        let run = chat_run("scripts/main.gpt".into(), Options::default());
        let body = run.request_body().expect("body").expect("present");
        assert_eq!(body["file"], "scripts/main.gpt");
        assert!(body.get("toolDefs").is_none());
    }

    #[test]
    fn unit_basic_request_body_is_sent_verbatim() {
        let run = Run::basic(
            reqwest::Client::new(),
            "fmt",
            Some(json!({"nodes": []})),
            "http://127.0.0.1:1",
            "",
        );
        assert_eq!(
            run.request_body().expect("body"),
            Some(json!({"nodes": []}))
        );
        let version = Run::basic(reqwest::Client::new(), "version", None, "", "");
        assert_eq!(version.request_body().expect("body"), None);
    }

    #[test]
    fn functional_successor_carries_chat_state_only_after_continue() {
        let options = Options {
            chat_state: "{\"turn\":1}".to_string(),
            ..Options::default()
        };
        let run = chat_run(ToolPayload::None, options);

        run.progress_tx.send_modify(|progress| {
            progress.state = RunState::Continue;
            progress.chat_state = "{\"turn\":2}".to_string();
        });
        assert_eq!(run.successor().options.chat_state, "{\"turn\":2}");

        run.progress_tx.send_modify(|progress| {
            progress.state = RunState::Error;
            progress.chat_state = "{\"turn\":3}".to_string();
        });
        assert_eq!(run.successor().options.chat_state, "{\"turn\":1}");
    }

    #[test]
    fn regression_unstarted_run_rejects_cancel_and_basic_rejects_continue() {
        let run = chat_run(ToolPayload::None, Options::default());
        assert!(matches!(run.cancel(), Err(RunError::InvalidState(_))));

        let basic = Run::basic(reqwest::Client::new(), "version", None, "", "");
        assert!(matches!(
            basic.next_chat(""),
            Err(RunError::InvalidState(_))
        ));
    }

    #[test]
    fn regression_running_run_rejects_next_chat() {
        let run = chat_run(ToolPayload::None, Options::default());
        for state in [RunState::Running, RunState::Finished] {
            run.progress_tx.send_modify(|progress| progress.state = state);
            assert!(matches!(
                run.next_chat("again"),
                Err(RunError::InvalidState(_))
            ));
        }
    }

    #[tokio::test]
    async fn regression_request_timeout_limits_idle_time_not_run_length() {
        let mut records: Vec<Value> = (0..8)
            .map(|index| {
                json!({"call": {"id": format!("c{index}"), "type": "callProgress", "toolCategory": ""}})
            })
            .collect();
        records.push(json!({"stdout": "finished"}));
        let (url, server) =
            spawn_paced_engine(records, Duration::from_millis(300), Duration::ZERO).await;

        let http = engine_http_client_with_timeout(Duration::from_secs(1)).expect("client");
        let mut run = started_run(http, url);

        assert_eq!(run.text().await.expect("output"), "finished");
        assert_eq!(run.state(), RunState::Finished);
        assert_eq!(run.calls().len(), 8);
        server.await.expect("server task");
    }

    #[tokio::test]
    async fn regression_aborted_run_error_keeps_side_channel_text() {
        let (url, server) = spawn_paced_engine(
            vec![json!({"stderr": "warming up\n"})],
            Duration::ZERO,
            Duration::from_secs(30),
        )
        .await;
        let http = engine_http_client_with_timeout(Duration::from_secs(60)).expect("client");
        let mut run = started_run(http, url);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while run.err_output().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "stderr never arrived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        run.cancel().expect("cancel");

        match run.text().await {
            Err(RunError::Aborted { err_output }) => assert_eq!(err_output, "warming up\n"),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(run.was_aborted());
        server.abort();
    }
}
