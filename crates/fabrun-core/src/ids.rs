//! Identity of a task run and name handling derived from it.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Job ids issued by the Control Center: a date segment and an id segment.
    static ref JOB_ID: Regex =
        Regex::new(r"^(\d{6})-(\d{4}-[0-9A-Fa-f]{4})$").expect("job id pattern");
}

/// Identifies one execution of a task, as assigned by the Control Center.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunIdent {
    pub job_id: String,
    pub task_id: String,
    pub run_id: String,
}

impl RunIdent {
    pub fn new(
        job_id: impl Into<String>,
        task_id: impl Into<String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            task_id: task_id.into(),
            run_id: run_id.into(),
        }
    }

    /// Directory fragment for this run's job.
    ///
    /// Job ids of the form `DDDDDD-DDDD-XXXX` split into `DDDDDD/DDDD-XXXX`;
    /// any other id is used verbatim.
    pub fn job_path(&self) -> String {
        match JOB_ID.captures(&self.job_id) {
            Some(caps) => format!("{}/{}", &caps[1], &caps[2]),
            None => self.job_id.clone(),
        }
    }
}

/// Converts an arbitrary string to a valid variable name by replacing every
/// character outside `[A-Za-z0-9_]` with an underscore and prefixing `X` when
/// the first character is a digit.
pub fn sanitize_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.chars().next().is_some_and(|c| c.is_ascii_digit()) {
        out.insert(0, 'X');
    }
    out
}
