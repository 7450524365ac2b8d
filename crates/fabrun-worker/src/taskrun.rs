//! Execution of a single task run.
//!
//! A task run writes the startup script, launches the interpreter on it,
//! and turns the wrapper's exit code and results file into a reportable
//! result. The abort path optionally runs an abort wrapper before
//! terminating the child.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::task::JoinHandle;
use tracing::{info, warn};

use fabrun_core::{
    sanitize_name, ResultCode, RunError, TaskResult, TaskRunError, VarMap, VarValue,
};

use crate::factory::RunFactory;
use crate::process::ExternalProcess;
use crate::protocol::RunKindInfo;
use crate::runlog::RunLog;
use crate::script::LanguageRun;
use crate::status::RunStatus;

/// One particular execution of a task.
pub struct TaskRun {
    factory: Arc<RunFactory>,
    language: Box<dyn LanguageRun>,
    output_dir: PathBuf,
    log: Arc<RunLog>,
    state: Mutex<RunState>,
}

#[derive(Default)]
struct RunState {
    aborted: bool,
    /// Processes being executed, kept for aborting. At most one today, but
    /// the abort path does not rely on that.
    processes: Vec<Arc<ExternalProcess>>,
    abort_task: Option<JoinHandle<()>>,
}

impl TaskRun {
    /// Locate the wrapper for `factory` and build the run. `None` when no
    /// wrapper of this flavor exists.
    pub fn create(
        factory: Arc<RunFactory>,
        output_dir: &Path,
        log: Arc<RunLog>,
    ) -> Result<Option<Arc<TaskRun>>, TaskRunError> {
        let Some(language) = factory.create_wrapper(output_dir, &log)? else {
            return Ok(None);
        };
        Ok(Some(Arc::new(TaskRun {
            factory,
            language,
            output_dir: output_dir.to_owned(),
            log,
            state: Mutex::new(RunState::default()),
        })))
    }

    pub fn log(&self) -> &Arc<RunLog> {
        &self.log
    }

    /// Execute the task with the parameters of this run.
    pub async fn execute(&self) -> Result<TaskResult, RunError> {
        let startup_name = self
            .language
            .startup_file_name(&self.factory.startup_file_base_name());
        let startup_path = self.output_dir.join(&startup_name);

        let vars = self.create_task_environment()?;
        let mut script = String::new();
        self.language.write_startup_script(&vars, &mut script)?;
        std::fs::write(&startup_path, script).map_err(|e| {
            TaskRunError::with_source(format!("Error writing \"{startup_name}\""), e)
        })?;

        let command = self.language.startup_command(&startup_path);
        let process = Arc::new(ExternalProcess::new(
            &self.output_dir,
            command,
            self.language.environment(),
            self.factory.config.generic.process_wrapper.as_deref(),
            self.log.clone(),
        ));
        let exit_code = self.monitor_process(process).await?;
        self.read_result_file(exit_code)
    }

    /// Abort task execution in progress: run the abort wrapper if there is
    /// one, then terminate the external process. Aborting twice is a no-op.
    pub fn abort(self: Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.aborted {
                // Abort already in progress.
                return;
            }
            state.aborted = true;
        }
        match self.abort_run() {
            None => self.abort_external(),
            Some(abort_run) => {
                let this = self.clone();
                let task = tokio::spawn(async move {
                    if let Err(e) = abort_run.execute().await {
                        this.log
                            .warning(&format!("Exception during running abort wrapper: {e}"));
                    }
                    this.abort_external();
                });
                self.lock_state().abort_task = Some(task);
            }
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.lock_state().aborted
    }

    /// Wait for the abort task (if any) to end. Must be called before the
    /// run is discarded.
    pub async fn wait_for_completion(&self) {
        let task = self.lock_state().abort_task.take();
        if let Some(task) = task {
            self.log.info("Waiting for abort to complete");
            if task.await.is_err() {
                self.log.warning("Abort task failed");
            }
        }
    }

    fn abort_run(&self) -> Option<Arc<TaskRun>> {
        let abort_factory = Arc::new(self.factory.abort_factory());
        match TaskRun::create(abort_factory, &self.output_dir, self.log.clone()) {
            Ok(run) => run,
            Err(e) => {
                self.log
                    .warning(&format!("Exception during instantiating abort wrapper: {e}"));
                None
            }
        }
    }

    fn abort_external(&self) {
        self.log.info("Aborting external processes");
        let processes: Vec<_> = self.lock_state().processes.drain(..).collect();
        for process in processes {
            process.abort();
        }
    }

    /// Run one external process to completion, keeping it reachable for the
    /// abort path while it runs.
    async fn monitor_process(&self, process: Arc<ExternalProcess>) -> Result<i32, RunError> {
        {
            let mut state = self.lock_state();
            if state.aborted {
                return Err(RunError::Aborted);
            }
            state.processes.push(process.clone());
        }
        let outcome = async {
            process
                .start()
                .map_err(|e| TaskRunError::with_source("Error executing wrapper", e))?;
            Ok::<i32, TaskRunError>(process.wait_for().await?)
        }
        .await;
        self.lock_state().processes.retain(|p| !Arc::ptr_eq(p, &process));

        let exit_code = outcome?;
        if self.is_aborted() {
            return Err(RunError::Aborted);
        }
        Ok(exit_code)
    }

    /// Read the result from the results file written by the wrapper, or
    /// derive it from the exit code when the wrapper failed.
    fn read_result_file(&self, exit_code: i32) -> Result<TaskResult, RunError> {
        if exit_code != 0 {
            return Ok(TaskResult::new(
                ResultCode::Error,
                Some(format!("wrapper exit code: {exit_code}")),
            ));
        }
        let Some(file_name) = self.factory.result_file_name() else {
            return Ok(TaskResult::new(ResultCode::Ok, None));
        };
        let path = self.output_dir.join(file_name);
        if !path.exists() {
            return Ok(TaskResult::new(
                ResultCode::Error,
                Some(format!("missing result file \"{file_name}\"")),
            ));
        }
        let text = std::fs::read_to_string(&path).map_err(|e| {
            TaskRunError::with_source(format!("Error reading result file \"{file_name}\""), e)
        })?;
        let result = TaskResult::parse(&text).map_err(|e| {
            TaskRunError::with_source(format!("Error parsing result file \"{file_name}\""), e)
        })?;
        Ok(result)
    }

    /// Build the standard task environment: the `SF_` variables, input
    /// locators, reserved resources, and task parameters except the
    /// internal `sf.`-prefixed ones.
    fn create_task_environment(&self) -> Result<VarMap, TaskRunError> {
        let info = &self.factory.run_info;
        let config = &self.factory.config;
        let mut vars = VarMap::new();

        vars.insert("SF_REPORT_ROOT", path_text(&absolute(&self.output_dir)));
        vars.insert(
            "SF_PRODUCT_ROOT",
            path_text(&absolute(
                &config.output.product_base_dir.join(info.run.job_path()),
            )),
        );
        let wrapper_root = self
            .language
            .wrapper_path()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        vars.insert("SF_WRAPPER_ROOT", path_text(&wrapper_root));
        vars.insert("SF_JOB_ID", info.run.job_id.as_str());
        vars.insert("SF_TASK_ID", info.run.task_id.as_str());
        vars.insert("SF_TARGET", info.task.target.as_str());

        vars.insert(
            "SF_INPUTS",
            VarValue::seq_of(info.inputs.keys().map(String::as_str)),
        );
        let mut combined = VarMap::new();
        for input in info.inputs.values() {
            vars.insert(input.name.as_str(), input.locator.as_str());
            if input.is_combined() {
                let mut producers = VarMap::new();
                for (task_name, producer) in &input.producers {
                    let mut entry = VarMap::new();
                    entry.insert("TASK", producer.task_id.as_str());
                    entry.insert("RESULT", producer.result.as_str());
                    entry.insert("LOCATOR", producer.locator.as_str());
                    let name = sanitize_name(task_name);
                    if producers.get(&name).is_some() {
                        return Err(TaskRunError::new(format!(
                            "Duplicate converted task name: {name}"
                        )));
                    }
                    producers.insert(name, entry);
                }
                combined.insert(input.name.as_str(), producers);
            }
        }
        if !combined.is_empty() {
            vars.insert("SF_PROD", combined);
        }

        // The output set is kept sorted; users will expect a stable order
        // even though it is not promised anywhere.
        vars.insert(
            "SF_OUTPUTS",
            VarValue::seq_of(info.outputs.iter().map(String::as_str)),
        );

        if let RunKindInfo::Execute { resources } = &info.kind {
            vars.insert(
                "SF_RESOURCES",
                VarValue::seq_of(resources.iter().map(|r| r.reference.as_str())),
            );
            for resource in resources {
                vars.insert(resource.reference.as_str(), resource.locator.as_str());
            }
        }

        for (name, value) in &info.task.parameters {
            if !name.starts_with("sf.") {
                vars.insert(name.as_str(), value.as_str());
            }
        }

        if let Some(result_file) = self.factory.result_file_name() {
            vars.insert(
                "SF_RESULTS",
                path_text(&absolute(&self.output_dir.join(result_file))),
            );
        }
        vars.insert(
            "SF_CC_URL",
            config.control_center.server_base_url.as_str(),
        );
        for (name, value) in &config.parameters {
            vars.insert(name.as_str(), value.as_str());
        }
        Ok(vars)
    }

    fn lock_state(&self) -> MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Resolve against the current directory without touching the filesystem.
fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_owned())
    }
}

fn path_text(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Handle through which the sync loop can abort the running task.
pub struct RunHandle {
    task_run: Mutex<Option<Arc<TaskRun>>>,
}

impl RunHandle {
    /// Abort the run; handled asynchronously. No-op once the run finished.
    pub fn abort(&self) {
        let run = self
            .task_run
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(run) = run {
            run.abort();
        }
    }

    fn finish(&self) -> Option<Arc<TaskRun>> {
        self.task_run.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// Set up a run and spawn its worker. Setup happens on the caller, which
/// keeps command ordering simple; the worker always ends in `run_finished`,
/// reporting exactly one result.
pub async fn launch(factory: Arc<RunFactory>, status: Arc<RunStatus>) {
    let run_info = factory.run_info.clone();
    info!(
        "Task \"{}\": starting {}",
        run_info.run.task_id,
        run_info.action_text()
    );

    let run = match set_up(&factory).await {
        Ok(run) => run,
        Err(e) => {
            // Worker not spawned, so report the result here.
            warn!(
                "Error preparing {} of task \"{}\": {e}",
                run_info.action_text(),
                run_info.run.task_id
            );
            status.run_finished(&factory, e.to_result());
            return;
        }
    };

    let handle = Arc::new(RunHandle {
        task_run: Mutex::new(Some(run.clone())),
    });
    status.run_started(handle.clone(), run_info);
    tokio::spawn(drive(run, handle, factory, status));
}

async fn set_up(factory: &Arc<RunFactory>) -> Result<Arc<TaskRun>, TaskRunError> {
    let run = &factory.run_info.run;
    let output_dir = factory
        .config
        .output
        .report_base_dir
        .join(run.job_path())
        .join(&run.task_id);
    factory.create_work_env(&output_dir).await?;

    let log_path = output_dir.join(factory.log_file_name());
    let log = Arc::new(
        RunLog::create(&log_path)
            .map_err(|e| TaskRunError::with_source("Could not create log file", e))?,
    );
    log.info(&format!("Task Runner version {}", crate::VERSION));
    factory.report_url();

    TaskRun::create(factory.clone(), &output_dir, log.clone())?.ok_or_else(|| {
        let message = format!(
            "No wrapper implementation found for wrapper \"{}\"",
            factory.wrapper_name().unwrap_or_default()
        );
        log.info(&message);
        TaskRunError::new(message)
    })
}

/// Worker body: execute, classify the outcome, wait for a pending abort,
/// then release the run slot and report.
async fn drive(
    run: Arc<TaskRun>,
    handle: Arc<RunHandle>,
    factory: Arc<RunFactory>,
    status: Arc<RunStatus>,
) {
    let run_info = factory.run_info.clone();
    let execution = {
        let run = run.clone();
        tokio::spawn(async move { run.execute().await })
    };

    let result = match execution.await {
        Ok(Ok(result)) => {
            info!(
                "Task \"{}\": finished {}",
                run_info.run.task_id,
                run_info.action_text()
            );
            result
        }
        Ok(Err(RunError::Aborted)) => {
            run.log().info("Task run aborted");
            RunError::Aborted.to_result()
        }
        Ok(Err(RunError::Task(e))) => {
            run.log().warning(&format!("Task run terminated: {e}"));
            e.to_result()
        }
        Err(e) => {
            // The worker panicked or was cancelled.
            TaskResult::new(
                ResultCode::Error,
                Some(format!("Task run failed because of error in Task Runner: {e}")),
            )
        }
    };

    let summary = result.summary().unwrap_or("(no summary)");
    if result.code() == ResultCode::Error {
        warn!("Task run failed: {summary}");
    } else {
        info!("Task run finished: {summary}");
    }

    // Once the slot is cleared the run can no longer be aborted; wait for an
    // abort already in flight before reporting.
    if let Some(run) = handle.finish() {
        run.wait_for_completion().await;
    }
    status.run_finished(&factory, result);
}
