//! Binds a task descriptor to a run flavor: wrapper lookup, work
//! environment, and result reporting.
//!
//! The same factory exists in three flavors. Execution and extraction runs
//! differ in file names and report shape; the abort flavor derives from
//! either of them, shares its log, and reports nothing.

use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fabrun_core::{ResultCode, TaskResult, TaskRunError};

use crate::config::Config;
use crate::protocol::{RunKindInfo, TaskRunInfo};
use crate::runlog::RunLog;
use crate::script::{
    AntRun, BatchRun, LanguageRun, MakeRun, NAntRun, PerlRun, PythonRun, RubyRun, ShellRun,
    WshRun,
};
use crate::server::{ApiReplyListener, FormRequest, RequestQueue, ServerRequest};

const CREATE_DIR_RETRY_COUNT: u32 = 5;
const CREATE_DIR_DELAY_FIXED_MS: u64 = 1000;
const CREATE_DIR_DELAY_RANDOM_MS: u64 = 4000;
const CREATE_DIR_DELAY_FACTOR: f64 = 1.6;

/// The two primary run flavors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunFlavor {
    Execution,
    Extraction,
}

pub struct RunFactory {
    pub config: Arc<Config>,
    pub run_info: Arc<TaskRunInfo>,
    flavor: RunFlavor,
    /// True for the abort-wrapper variant of the flavor.
    abort: bool,
    queue: RequestQueue,
}

impl RunFactory {
    pub fn new(config: Arc<Config>, run_info: Arc<TaskRunInfo>, queue: RequestQueue) -> Self {
        let flavor = match run_info.kind {
            RunKindInfo::Execute { .. } => RunFlavor::Execution,
            RunKindInfo::Extract { .. } => RunFlavor::Extraction,
        };
        Self {
            config,
            run_info,
            flavor,
            abort: false,
            queue,
        }
    }

    /// The factory for this run's abort wrapper.
    pub fn abort_factory(&self) -> Self {
        Self {
            config: self.config.clone(),
            run_info: self.run_info.clone(),
            flavor: self.flavor,
            abort: true,
            queue: self.queue.clone(),
        }
    }

    /// File name of the run log artifact. The abort run logs into the log of
    /// the run being aborted.
    pub fn log_file_name(&self) -> &'static str {
        match self.flavor {
            RunFlavor::Execution => "wrapper_log.txt",
            RunFlavor::Extraction => "extraction_log.txt",
        }
    }

    /// Base name of the startup script written into the report directory.
    pub fn startup_file_base_name(&self) -> String {
        let base = match self.flavor {
            RunFlavor::Execution => "execute",
            RunFlavor::Extraction => "extract",
        };
        if self.abort {
            format!("{base}_abort")
        } else {
            base.to_owned()
        }
    }

    /// Part of the wrapper file name before the extension.
    pub fn wrapper_file_name_base(&self) -> String {
        let base = match self.flavor {
            RunFlavor::Execution => "wrapper",
            RunFlavor::Extraction => "extractor",
        };
        if self.abort {
            format!("{base}_abort")
        } else {
            base.to_owned()
        }
    }

    /// File name of the results file, or `None` if this run type does not
    /// write one.
    pub fn result_file_name(&self) -> Option<&'static str> {
        if self.abort {
            return None;
        }
        match self.flavor {
            RunFlavor::Execution => Some("results.properties"),
            RunFlavor::Extraction => Some("extracted.properties"),
        }
    }

    pub fn wrapper_name(&self) -> Option<&str> {
        self.run_info.wrapper_name()
    }

    /// Set up the working environment for the run. Extraction and abort runs
    /// reuse the environment created for the execution run.
    pub async fn create_work_env(&self, output_dir: &Path) -> Result<(), TaskRunError> {
        if self.abort || self.flavor != RunFlavor::Execution {
            return Ok(());
        }

        // Creating a directory on a network share can fail transiently, so
        // retry with growing, jittered delays before giving up.
        let mut fixed = CREATE_DIR_DELAY_FIXED_MS;
        let mut range = CREATE_DIR_DELAY_RANDOM_MS;
        for attempt in 0..=CREATE_DIR_RETRY_COUNT {
            match std::fs::create_dir_all(output_dir) {
                Ok(()) => return Ok(()),
                Err(_) if attempt < CREATE_DIR_RETRY_COUNT => {
                    tokio::time::sleep(Duration::from_millis(
                        fixed + jitter_ms(output_dir, attempt, range),
                    ))
                    .await;
                    fixed = (fixed as f64 * CREATE_DIR_DELAY_FACTOR) as u64;
                    range = (range as f64 * CREATE_DIR_DELAY_FACTOR) as u64;
                }
                Err(e) => {
                    return Err(TaskRunError::with_source(
                        format!(
                            "Could not create output directory: \"{}\"",
                            output_dir.display()
                        ),
                        e,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Advertise the URL under which this run's reports will be published.
    /// Only done for execution runs, and only when a report base URL is
    /// configured.
    pub fn report_url(&self) {
        if self.abort || self.flavor != RunFlavor::Execution {
            return;
        }
        let Some(base) = &self.config.output.report_base_url else {
            return;
        };
        let run = &self.run_info.run;
        let mut request = FormRequest::new("TaskReport");
        request.add_query_param("id", &run.job_id);
        request.add_query_param("name", &run.task_id);
        request.add_body_param(
            "url",
            format!(
                "{}/{}/{}/",
                base.trim_end_matches('/'),
                run.job_path(),
                run.task_id
            ),
        );
        self.queue.submit(
            ServerRequest::Form(request),
            Arc::new(ApiReplyListener::new("report task URL")),
        );
    }

    /// Report the run's result to the Control Center.
    pub fn report_result(&self, result: &TaskResult) {
        if self.abort {
            // The abort wrapper's own outcome is not reported.
            return;
        }
        match self.flavor {
            RunFlavor::Execution => self.report_execution_result(result),
            RunFlavor::Extraction => self.report_extraction_result(result),
        }
    }

    fn report_execution_result(&self, result: &TaskResult) {
        let run = &self.run_info.run;
        let mut request = FormRequest::new("TaskDone");
        request.add_query_param("id", &run.job_id);
        request.add_query_param("name", &run.task_id);
        if result.code() != ResultCode::Unknown {
            request.add_body_param("result", result.code().as_str());
        }
        if let Some(summary) = result.summary() {
            request.add_body_param("summary", summary);
        }
        let mut reports: Vec<String> = result.reports().map(report_file_name).collect();
        reports.push(self.log_file_name().to_owned());
        request.add_body_param_seq("report", reports);
        request.add_body_params(
            result
                .output_locators()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        request.add_body_params(
            result
                .extracted_data()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.queue.submit(
            ServerRequest::Form(request),
            Arc::new(ApiReplyListener::new("submit task done notice")),
        );
    }

    fn report_extraction_result(&self, result: &TaskResult) {
        let RunKindInfo::Extract { shadow_id } = &self.run_info.kind else {
            return;
        };
        let mut request = FormRequest::new("TaskDone");
        request.add_query_param("shadowId", shadow_id);
        if result.extract_code() != ResultCode::Unknown {
            request.add_body_param("extraction.result", result.extract_code().as_str());
        }
        if let Some(summary) = result.summary() {
            request.add_body_param("summary", summary);
        }
        request.add_body_params(
            result
                .extracted_data()
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        self.queue.submit(
            ServerRequest::Form(request),
            Arc::new(ApiReplyListener::new("submit extraction results")),
        );
    }

    /// Locate the wrapper for this flavor and build the matching language
    /// binding. Returns `None` when no wrapper was found; wrappers can be
    /// optional (the abort wrapper, for example), so this is not an error.
    pub fn create_wrapper(
        &self,
        output_dir: &Path,
        log: &Arc<RunLog>,
    ) -> Result<Option<Box<dyn LanguageRun>>, TaskRunError> {
        let wrapper = self
            .wrapper_name()
            .ok_or_else(|| TaskRunError::new("Task has no \"sf.wrapper\" parameter"))?;
        let base = self.wrapper_file_name_base();

        for base_dir in &self.config.wrappers {
            let wrapper_dir = base_dir.join(wrapper);
            if !wrapper_dir.is_dir() {
                continue;
            }
            let wrapper_dir = wrapper_dir
                .canonicalize()
                .map_err(|e| TaskRunError::with_source("Error canonicalizing wrappers dir", e))?;
            let candidates = wrapper_candidates(&wrapper_dir, &base)?;
            for (extension, language) in extension_priority() {
                if let Some(name) = candidates.iter().find(|n| n.ends_with(extension)) {
                    let run = self.instantiate(
                        language,
                        wrapper_dir.join(name),
                        output_dir,
                        log,
                    )?;
                    return Ok(Some(run));
                }
            }
        }
        Ok(None)
    }

    fn instantiate(
        &self,
        language: Language,
        wrapper_path: PathBuf,
        output_dir: &Path,
        log: &Arc<RunLog>,
    ) -> Result<Box<dyn LanguageRun>, TaskRunError> {
        Ok(match language {
            Language::Batch => Box::new(BatchRun::new(wrapper_path, log)),
            Language::Shell => Box::new(ShellRun::new(wrapper_path, log)),
            Language::Make => Box::new(MakeRun::new(wrapper_path, output_dir.to_owned(), log)),
            Language::Perl => Box::new(PerlRun::new(wrapper_path, log)),
            Language::Python => Box::new(PythonRun::new(wrapper_path, log)),
            Language::Ruby => Box::new(RubyRun::new(wrapper_path, log)),
            Language::Ant => Box::new(AntRun::new(wrapper_path, log)),
            Language::NAnt => Box::new(NAntRun::new(wrapper_path, log)),
            Language::Wsh => Box::new(WshRun::new(wrapper_path, &self.config.wrappers, log)?),
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Language {
    Batch,
    Shell,
    Make,
    Perl,
    Python,
    Ruby,
    Ant,
    NAnt,
    Wsh,
}

/// Supported wrapper extensions in priority order. The Windows-only script
/// hosts are not offered elsewhere.
fn extension_priority() -> Vec<(&'static str, Language)> {
    let mut list = Vec::new();
    if cfg!(windows) {
        list.push((".bat", Language::Batch));
    }
    list.extend([
        (".sh", Language::Shell),
        (".mk", Language::Make),
        (".pl", Language::Perl),
        (".py", Language::Python),
        (".rb", Language::Ruby),
        (".xml", Language::Ant),
        (".build", Language::NAnt),
    ]);
    if cfg!(windows) {
        list.push((".vbs", Language::Wsh));
        list.push((".js", Language::Wsh));
    }
    list
}

/// File names in `wrapper_dir` of the form `<base>.<ext>`, with the single
/// dot directly after the base.
fn wrapper_candidates(wrapper_dir: &Path, base: &str) -> Result<Vec<String>, TaskRunError> {
    let entries = std::fs::read_dir(wrapper_dir)
        .map_err(|e| TaskRunError::with_source("Error listing wrappers dir", e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry =
            entry.map_err(|e| TaskRunError::with_source("Error listing wrappers dir", e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(base) && name.rfind('.') == Some(base.len()) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Report paths may be absolute; only the file name is sent upstream.
fn report_file_name(report: &str) -> String {
    Path::new(report)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| report.to_owned())
}

/// Deterministic pseudo-jitter; only de-synchronises retries, so it needs no
/// statistical quality.
fn jitter_ms(path: &Path, attempt: u32, range: u64) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    path.hash(&mut hasher);
    attempt.hash(&mut hasher);
    if let Ok(elapsed) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
        elapsed.subsec_nanos().hash(&mut hasher);
    }
    hasher.finish() % range.max(1)
}
