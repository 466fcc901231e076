//! Engine that launches an external program once per task.
//!
//! For each task the configured command is spawned as
//! `command [args..] <task-name>` with the job context in `FLEET_*`
//! environment variables and the resolved options as JSON on stdin.
//! Output lines become task logs: stdout at `info`, stderr at `warn`. A
//! stdout line that is a JSON object with a `message` field is taken as a
//! structured log record (`level`, `node_name`, `event_type`).
//!
//! Exit status 0 means the task succeeded. Stopping the job kills the running
//! child and fails the job with [`EngineError::Stopped`].

use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use fleet_core::{
    Capabilities, Job, JobId, JobProgress, LogLevel, TaskItem, TaskLogEntry, TaskStatusReport,
    WindowFilter,
};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    Engine, OptionResolver, PassthroughResolver, Screenshot, SinkSlot, TelemetrySink,
    UNKNOWN_VERSION,
};
use crate::config::EngineSettings;
use crate::error::EngineError;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// A window selected by the window list: `(class, title)`.
type Window = (String, String);

pub struct ProcessEngine {
    settings: EngineSettings,
    resolver: Arc<dyn OptionResolver>,
    window_filter: WindowFilter,
    sinks: SinkSlot,
    stop_requested: AtomicBool,
    cancel: Mutex<CancellationToken>,
}

impl ProcessEngine {
    pub fn new(settings: EngineSettings, resolver: Arc<dyn OptionResolver>) -> Self {
        let window_filter = WindowFilter::new(&settings.window_class, &settings.window_title);
        Self {
            settings,
            resolver,
            window_filter,
            sinks: SinkSlot::default(),
            stop_requested: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    /// Builds an engine with the passthrough resolver, or `None` when no
    /// command is configured.
    pub fn from_settings(settings: &EngineSettings) -> Option<Self> {
        if !settings.is_configured() {
            return None;
        }
        Some(Self::new(settings.clone(), Arc::new(PassthroughResolver)))
    }

    fn program(&self) -> Result<&str, EngineError> {
        self.settings
            .command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .ok_or(EngineError::NotInitialized)
    }

    fn advertised(&self) -> Capabilities {
        Capabilities {
            tasks: self.settings.tasks.clone(),
            controllers: self.settings.controllers.clone(),
            resources: self.settings.resources.clone(),
        }
    }

    /// Empty controller or resource lists accept anything; tasks must always
    /// be advertised.
    fn validate(&self, job: &Job) -> Result<(), EngineError> {
        let caps = self.advertised();
        if !caps.controllers.is_empty() && !caps.has_controller(&job.controller) {
            return Err(EngineError::UnknownController(job.controller.clone()));
        }
        if !caps.resources.is_empty() && !caps.has_resource(&job.resource) {
            return Err(EngineError::UnknownResource(job.resource.clone()));
        }
        if let Some(task) = job.tasks.iter().find(|t| !caps.has_task(&t.name)) {
            return Err(EngineError::UnknownTask(task.name.clone()));
        }
        Ok(())
    }

    fn lock_cancel(&self) -> MutexGuard<'_, CancellationToken> {
        self.cancel.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Token of the current job; cancelled by `stop_task`.
    fn job_token(&self) -> CancellationToken {
        self.lock_cancel().clone()
    }

    fn is_stop_requested(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
    }

    /// Runs the window list command and returns the first window that passes the
    /// filter. Without that command no window is selected.
    async fn find_window(&self) -> Result<Option<Window>, EngineError> {
        let Some(program) = self
            .settings
            .window_list_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        else {
            return Ok(None);
        };

        let output = Command::new(program)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| process_error(program, e))?;

        if !output.status.success() {
            warn!(command = program, status = %output.status, "Window list command failed");
            return Err(EngineError::NoMatchingWindow);
        }

        let listing = String::from_utf8_lossy(&output.stdout);
        let window = select_window(&listing, &self.window_filter);
        match &window {
            Some((class, title)) => debug!(class = %class, title = %title, "Selected window"),
            None => return Err(EngineError::NoMatchingWindow),
        }
        Ok(window)
    }

    async fn run_one(
        &self,
        program: &str,
        job: &Job,
        index: usize,
        task: &TaskItem,
        window: Option<&Window>,
        token: &CancellationToken,
    ) -> Result<(), EngineError> {
        let overrides =
            self.resolver
                .resolve(&task.name, &task.options)
                .map_err(|e| match e {
                    EngineError::Options { .. } => e,
                    other => EngineError::Options {
                        task: task.name.clone(),
                        reason: other.to_string(),
                    },
                })?;
        let input = serde_json::to_vec(&overrides).map_err(|e| EngineError::Options {
            task: task.name.clone(),
            reason: e.to_string(),
        })?;

        let (window_class, window_title) = window
            .map(|(c, t)| (c.as_str(), t.as_str()))
            .unwrap_or_default();

        let mut cmd = Command::new(program);
        cmd.args(&self.settings.args)
            .arg(&task.name)
            .env("FLEET_JOB_ID", job.job_id.as_str())
            .env("FLEET_TASK", &task.name)
            .env("FLEET_TASK_INDEX", index.to_string())
            .env("FLEET_CONTROLLER", &job.controller)
            .env("FLEET_RESOURCE", &job.resource)
            .env("FLEET_WINDOW_CLASS", window_class)
            .env("FLEET_WINDOW_TITLE", window_title)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.settings.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| process_error(program, e))?;
        info!(
            job_id = %job.job_id,
            task = %task.name,
            pid = child.id().unwrap_or(0),
            "Task process spawned"
        );

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit, (), (), ()) = tokio::join!(
            wait_or_kill(&mut child, token, program),
            feed_stdin(stdin, input),
            pump_lines(stdout, LogLevel::Info, &job.job_id, &task.name, &self.sinks),
            pump_lines(stderr, LogLevel::Warn, &job.job_id, &task.name, &self.sinks),
        );

        match exit? {
            None => Err(EngineError::Stopped),
            Some(status) if status.success() => Ok(()),
            Some(status) => {
                warn!(job_id = %job.job_id, task = %task.name, status = %status, "Task process failed");
                Err(EngineError::TaskFailed {
                    name: task.name.clone(),
                })
            }
        }
    }
}

#[async_trait]
impl Engine for ProcessEngine {
    async fn capabilities(&self) -> Result<Capabilities, EngineError> {
        self.program()?;
        Ok(self.advertised())
    }

    fn prepare_job(&self) {
        *self.lock_cancel() = CancellationToken::new();
        self.stop_requested.store(false, Ordering::SeqCst);
    }

    async fn run_task(&self, job: &Job, sink: Arc<dyn TelemetrySink>) -> Result<(), EngineError> {
        let program = self.program()?;
        let token = self.job_token();
        self.sinks.install(sink);

        self.validate(job)?;
        if self.is_stop_requested() {
            return Err(EngineError::Stopped);
        }
        let window = self.find_window().await?;

        let caps = self.advertised();
        let total = job.total_tasks();
        for (index, task) in job.tasks.iter().enumerate() {
            if self.is_stop_requested() {
                return Err(EngineError::Stopped);
            }

            let label = caps
                .task(&task.name)
                .map_or(task.name.as_str(), |t| t.display_label());
            self.sinks.emit_status(TaskStatusReport::running(
                job.job_id.clone(),
                &task.name,
                JobProgress {
                    completed: index,
                    total,
                },
                format!("running {label}"),
            ));

            self.run_one(program, job, index, task, window.as_ref(), &token)
                .await?;
        }

        Ok(())
    }

    async fn stop_task(&self) -> Result<(), EngineError> {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.lock_cancel().cancel();
        Ok(())
    }

    async fn take_screenshot(&self) -> Result<Screenshot, EngineError> {
        let Some(program) = self
            .settings
            .screenshot_command
            .as_deref()
            .filter(|c| !c.trim().is_empty())
        else {
            return Err(EngineError::Screenshot(
                "no screenshot command configured".to_string(),
            ));
        };

        let output = Command::new(program)
            .args(&self.settings.screenshot_args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| process_error(program, e))?;

        if !output.status.success() {
            return Err(EngineError::Screenshot(format!(
                "{program} exited with {}",
                output.status
            )));
        }

        let (width, height) = png_dimensions(&output.stdout)
            .ok_or_else(|| EngineError::Screenshot("capture is not a PNG image".to_string()))?;

        Ok(Screenshot {
            data: output.stdout,
            width,
            height,
        })
    }

    fn clear_telemetry_sinks(&self) {
        self.sinks.clear();
    }

    fn version(&self) -> String {
        if self.settings.version.trim().is_empty() {
            UNKNOWN_VERSION.to_string()
        } else {
            self.settings.version.clone()
        }
    }
}

fn process_error(program: &str, err: std::io::Error) -> EngineError {
    EngineError::Process {
        command: program.to_string(),
        reason: err.to_string(),
    }
}

/// Waits for the child; `None` if it was killed because the job stopped.
async fn wait_or_kill(
    child: &mut Child,
    token: &CancellationToken,
    program: &str,
) -> Result<Option<ExitStatus>, EngineError> {
    tokio::select! {
        status = child.wait() => status.map(Some).map_err(|e| process_error(program, e)),
        () = token.cancelled() => {
            if let Err(e) = child.kill().await {
                warn!(command = program, error = %e, "Failed to kill task process");
            }
            Ok(None)
        }
    }
}

/// Writes the options and closes stdin so the child sees EOF.
async fn feed_stdin(stdin: Option<ChildStdin>, input: Vec<u8>) {
    let Some(mut stdin) = stdin else {
        return;
    };
    // A child that never reads stdin closes the pipe early.
    if let Err(e) = stdin.write_all(&input).await {
        debug!(error = %e, "Task process did not accept options");
    }
}

#[derive(Debug, Deserialize)]
struct StructuredLine {
    message: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    node_name: Option<String>,
    #[serde(default)]
    event_type: Option<String>,
}

/// Turns one output line into a log entry.
fn parse_line(job_id: &JobId, task: &str, level: LogLevel, line: &str) -> TaskLogEntry {
    if let Ok(structured) = serde_json::from_str::<StructuredLine>(line) {
        let level = structured
            .level
            .and_then(|l| l.parse().ok())
            .unwrap_or(level);
        let mut entry = TaskLogEntry::new(job_id.clone(), level, structured.message)
            .with_node(structured.node_name.unwrap_or_else(|| task.to_string()));
        if let Some(event_type) = structured.event_type {
            entry = entry.with_event_type(event_type);
        }
        return entry;
    }
    TaskLogEntry::new(job_id.clone(), level, line).with_node(task)
}

async fn pump_lines<R>(
    reader: Option<R>,
    level: LogLevel,
    job_id: &JobId,
    task: &str,
    sinks: &SinkSlot,
) where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else {
        return;
    };
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end();
                if line.is_empty() {
                    continue;
                }
                sinks.emit_log(parse_line(job_id, task, level, line));
            }
            Ok(None) => break,
            Err(e) => {
                debug!(task, error = %e, "Stopped reading task output");
                break;
            }
        }
    }
}

/// Picks the first `class<TAB>title` line accepted by `filter`.
fn select_window(listing: &str, filter: &WindowFilter) -> Option<Window> {
    listing
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once('\t') {
            Some((class, title)) => (class.trim().to_string(), title.trim().to_string()),
            None => (line.trim().to_string(), String::new()),
        })
        .find(|(class, title)| filter.matches(class, title))
}

/// Width and height from a PNG's IHDR chunk.
fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.get(..8)? != PNG_SIGNATURE.as_slice() || data.get(12..16)? != b"IHDR".as_slice() {
        return None;
    }
    let width = u32::from_be_bytes(data.get(16..20)?.try_into().ok()?);
    let height = u32::from_be_bytes(data.get(20..24)?.try_into().ok()?);
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::TaskInfo;
    use std::time::Duration;

    #[derive(Default)]
    struct CollectingSink {
        statuses: Mutex<Vec<TaskStatusReport>>,
        logs: Mutex<Vec<TaskLogEntry>>,
    }

    impl TelemetrySink for CollectingSink {
        fn emit_status(&self, report: TaskStatusReport) -> bool {
            self.statuses.lock().unwrap().push(report);
            true
        }

        fn emit_log(&self, entry: TaskLogEntry) -> bool {
            self.logs.lock().unwrap().push(entry);
            true
        }
    }

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut data = PNG_SIGNATURE.to_vec();
        data.extend_from_slice(&13u32.to_be_bytes());
        data.extend_from_slice(b"IHDR");
        data.extend_from_slice(&width.to_be_bytes());
        data.extend_from_slice(&height.to_be_bytes());
        data.extend_from_slice(&[8, 6, 0, 0, 0]);
        data
    }

    fn task(name: &str) -> TaskInfo {
        TaskInfo {
            name: name.to_string(),
            label: format!("{name} label"),
            ..Default::default()
        }
    }

    #[cfg(unix)]
    fn shell_engine(script: &str) -> ProcessEngine {
        ProcessEngine::from_settings(&EngineSettings {
            command: Some("sh".to_string()),
            args: vec!["-c".to_string(), script.to_string(), "engine".to_string()],
            version: "2.1.0".to_string(),
            controllers: vec!["Win32".to_string()],
            tasks: vec![task("Daily"), task("Farm")],
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_png_dimensions() {
        assert_eq!(png_dimensions(&png_header(1280, 720)), Some((1280, 720)));
        assert_eq!(png_dimensions(b"GIF89a"), None);
        assert_eq!(png_dimensions(&png_header(1, 1)[..20]), None);
    }

    #[test]
    fn test_select_window_applies_filter() {
        let listing = "Chrome_WidgetWin_1\tInbox\nUnityWndClass\tEndfield\n\nUnityWndClass\tOther\n";
        let filter = WindowFilter::new("^Unity", "Endfield");
        assert_eq!(
            select_window(listing, &filter),
            Some(("UnityWndClass".to_string(), "Endfield".to_string()))
        );
        assert_eq!(select_window(listing, &WindowFilter::new("Qt", "")), None);
        assert_eq!(
            select_window(listing, &WindowFilter::default()),
            Some(("Chrome_WidgetWin_1".to_string(), "Inbox".to_string()))
        );
    }

    #[test]
    fn test_parse_structured_and_plain_lines() {
        let job_id = JobId::new("j1");
        let entry = parse_line(
            &job_id,
            "Daily",
            LogLevel::Info,
            r#"{"message":"clicked start","level":"warning","node_name":"StartUp","event_type":"node"}"#,
        );
        assert_eq!(entry.level, LogLevel::Warn);
        assert_eq!(entry.message, "clicked start");
        assert_eq!(entry.node_name.as_deref(), Some("StartUp"));
        assert_eq!(entry.event_type.as_deref(), Some("node"));

        let plain = parse_line(&job_id, "Daily", LogLevel::Warn, r#"{"stage":"1-7"}"#);
        assert_eq!(plain.message, r#"{"stage":"1-7"}"#);
        assert_eq!(plain.level, LogLevel::Warn);
        assert_eq!(plain.node_name.as_deref(), Some("Daily"));
    }

    #[test]
    fn test_unconfigured_settings_yield_no_engine() {
        assert!(ProcessEngine::from_settings(&EngineSettings::default()).is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_each_task_with_options_on_stdin() {
        let engine = shell_engine(r#"echo "start $1 $FLEET_JOB_ID $FLEET_TASK_INDEX"; cat; echo oops >&2"#);
        let sink = Arc::new(CollectingSink::default());
        let job = Job::new(
            "j1",
            "Win32",
            "Official",
            vec![
                TaskItem::new("Daily"),
                TaskItem::new("Farm").with_option("stage", serde_json::json!("1-7")),
            ],
        );

        engine.run_task(&job, sink.clone()).await.unwrap();

        let statuses = sink.statuses.lock().unwrap();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[1].progress, JobProgress { completed: 1, total: 2 });
        assert_eq!(statuses[1].message, "running Farm label");

        let logs = sink.logs.lock().unwrap();
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert!(messages.contains(&"start Daily j1 0"));
        assert!(messages.contains(&"start Farm j1 1"));
        assert!(messages.contains(&r#"{"stage":"1-7"}"#));
        assert!(logs
            .iter()
            .any(|l| l.message == "oops" && l.level == LogLevel::Warn));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_fails_task() {
        let engine = shell_engine(r#"[ "$1" = "Farm" ] && exit 3; exit 0"#);
        let job = Job::new(
            "j1",
            "Win32",
            "",
            vec![TaskItem::new("Daily"), TaskItem::new("Farm")],
        );
        let err = engine
            .run_task(&job, Arc::new(CollectingSink::default()))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::TaskFailed {
                name: "Farm".to_string()
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_kills_running_task() {
        let engine = Arc::new(shell_engine("exec sleep 30"));
        let job = Job::new("j1", "Win32", "", vec![TaskItem::new("Daily")]);

        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .run_task(&job, Arc::new(CollectingSink::default()))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(300)).await;
        engine.stop_task().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), runner)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(EngineError::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_before_run_is_honoured() {
        let engine = shell_engine("exec sleep 30");
        let job = Job::new("j1", "Win32", "", vec![TaskItem::new("Daily")]);

        engine.prepare_job();
        engine.stop_task().await.unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            engine.run_task(&job, Arc::new(CollectingSink::default())),
        )
        .await
        .unwrap();
        assert_eq!(result, Err(EngineError::Stopped));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_prepare_job_clears_previous_stop() {
        let engine = shell_engine("exit 0");
        let job = Job::new("j2", "Win32", "", vec![TaskItem::new("Daily")]);

        engine.stop_task().await.unwrap();
        engine.prepare_job();

        engine
            .run_task(&job, Arc::new(CollectingSink::default()))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rejects_unadvertised_names() {
        let engine = shell_engine("exit 0");
        let sink: Arc<dyn TelemetrySink> = Arc::new(CollectingSink::default());

        let job = Job::new("j1", "Adb", "", vec![TaskItem::new("Daily")]);
        assert_eq!(
            engine.run_task(&job, sink.clone()).await,
            Err(EngineError::UnknownController("Adb".to_string()))
        );

        let job = Job::new("j1", "Win32", "", vec![TaskItem::new("Mystery")]);
        assert_eq!(
            engine.run_task(&job, sink).await,
            Err(EngineError::UnknownTask("Mystery".to_string()))
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_window_list_without_match_fails_job() {
        let engine = ProcessEngine::from_settings(&EngineSettings {
            command: Some("true".to_string()),
            tasks: vec![task("Daily")],
            window_list_command: Some("true".to_string()),
            window_class: "UnityWndClass".to_string(),
            ..Default::default()
        })
        .unwrap();
        let job = Job::new("j1", "", "", vec![TaskItem::new("Daily")]);
        assert_eq!(
            engine
                .run_task(&job, Arc::new(CollectingSink::default()))
                .await,
            Err(EngineError::NoMatchingWindow)
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_screenshot_reports_missing_command_and_bad_output() {
        let engine = shell_engine("exit 0");
        assert!(matches!(
            engine.take_screenshot().await,
            Err(EngineError::Screenshot(_))
        ));

        let engine = ProcessEngine::from_settings(&EngineSettings {
            command: Some("true".to_string()),
            screenshot_command: Some("echo".to_string()),
            screenshot_args: vec!["not a png".to_string()],
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            engine.take_screenshot().await,
            Err(EngineError::Screenshot(
                "capture is not a PNG image".to_string()
            ))
        );
    }

    #[test]
    fn test_version_falls_back_to_unknown() {
        let engine = ProcessEngine::from_settings(&EngineSettings {
            command: Some("true".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(engine.version(), UNKNOWN_VERSION);
    }
}
