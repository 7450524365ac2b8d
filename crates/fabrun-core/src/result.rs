//! In-memory form of a task's results file.

use std::collections::{BTreeMap, HashMap};

use lazy_static::lazy_static;
use regex::Regex;

use crate::error::TaskRunError;

lazy_static! {
    /// `key = value` lines; keys are dotted words, values lose surrounding
    /// whitespace but keep inner whitespace.
    static ref PROPERTY_LINE: Regex =
        Regex::new(r"^\s*([\w.]+)\s*=\s*((?:.*\S)?)\s*$").expect("property pattern");
    static ref OUTPUT_KEY: Regex =
        Regex::new(r"^output\.([^.]+)\.([^.]+)$").expect("output key pattern");
}

/// Outcome code of a task run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ResultCode {
    /// No code was reported (yet).
    #[default]
    Unknown,
    Ok,
    Warning,
    Error,
    /// The outcome needs human inspection.
    Inspect,
    /// Internal code: nothing worth reporting; suppresses the `TaskDone`
    /// call. It has no spelling in results files.
    Ignore,
}

impl ResultCode {
    /// Wire spelling of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultCode::Unknown => "unknown",
            ResultCode::Ok => "ok",
            ResultCode::Warning => "warning",
            ResultCode::Error => "error",
            ResultCode::Inspect => "inspect",
            ResultCode::Ignore => "ignore",
        }
    }

    /// Parse a code from a results file. The domain is closed; `unknown` and
    /// `ignore` cannot be written by a wrapper.
    fn parse_wire(value: &str) -> Result<ResultCode, TaskRunError> {
        match value {
            "ok" => Ok(ResultCode::Ok),
            "warning" => Ok(ResultCode::Warning),
            "error" => Ok(ResultCode::Error),
            "inspect" => Ok(ResultCode::Inspect),
            _ => Err(TaskRunError::new(format!(
                "Invalid result code \"{value}\""
            ))),
        }
    }
}

/// Results of a task run, as reported to the Control Center.
#[derive(Debug, Clone, Default)]
pub struct TaskResult {
    code: ResultCode,
    summary: Option<String>,
    /// Report paths keyed by priority; `report` is shorthand for priority 0.
    reports: BTreeMap<u32, String>,
    /// Output locators keyed by `output.<product>`.
    locators: HashMap<String, String>,
    /// Mid-level data keyed by `data.<key>` (prefix retained).
    extracted: HashMap<String, String>,
    extract_code: ResultCode,
}

impl TaskResult {
    /// Create a result with the given code and summary. Pass `None` as the
    /// summary to let the Control Center supply a default message.
    pub fn new(code: ResultCode, summary: Option<String>) -> Self {
        Self {
            code,
            summary,
            ..Self::default()
        }
    }

    /// Parse the contents of a results file.
    ///
    /// The file is line oriented: `key=value` pairs, blank lines and `#`
    /// comments. Any other line is a syntax error.
    pub fn parse(text: &str) -> Result<Self, TaskRunError> {
        let mut result = TaskResult::default();
        for line in text.lines() {
            if let Some(caps) = PROPERTY_LINE.captures(line) {
                result.apply_property(&caps[1], &caps[2])?;
            } else {
                let line = line.trim();
                if !line.is_empty() && !line.starts_with('#') {
                    return Err(TaskRunError::new(format!(
                        "Invalid property file syntax: {line}"
                    )));
                }
            }
        }
        Ok(result)
    }

    fn apply_property(&mut self, name: &str, value: &str) -> Result<(), TaskRunError> {
        if name == "result" {
            self.code = ResultCode::parse_wire(value)?;
        } else if name == "summary" {
            self.summary = Some(value.to_owned());
        } else if name == "extraction.result" {
            self.extract_code = ResultCode::parse_wire(value)?;
        } else if name.starts_with("data.") {
            // The prefix is kept; it is posted to the Control Center as-is.
            self.extracted.insert(name.to_owned(), value.to_owned());
        } else if name == "report" {
            // Just "report" is a shortcut for "report.0".
            self.reports.insert(0, value.to_owned());
        } else if let Some(priority) = name.strip_prefix("report.") {
            let priority: u32 = priority.parse().map_err(|_| {
                TaskRunError::new(format!("Invalid report priority: \"{priority}\""))
            })?;
            self.reports.insert(priority, value.to_owned());
        } else if let Some(caps) = OUTPUT_KEY.captures(name) {
            let (product, property) = (&caps[1], &caps[2]);
            if property == "locator" {
                self.locators
                    .insert(format!("output.{product}"), value.to_owned());
            } else {
                return Err(TaskRunError::new(format!(
                    "Unsupported output property: \"{property}\""
                )));
            }
        } else {
            return Err(TaskRunError::new(format!(
                "Don't know how to handle property: \"{name}\""
            )));
        }
        Ok(())
    }

    pub fn code(&self) -> ResultCode {
        self.code
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Report paths in priority order.
    pub fn reports(&self) -> impl Iterator<Item = &str> {
        self.reports.values().map(String::as_str)
    }

    /// Output locators keyed by `output.<product>`.
    pub fn output_locators(&self) -> &HashMap<String, String> {
        &self.locators
    }

    pub fn extract_code(&self) -> ResultCode {
        self.extract_code
    }

    /// Mid-level data keyed by `data.<key>`.
    pub fn extracted_data(&self) -> &HashMap<String, String> {
        &self.extracted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let result = TaskResult::parse(
            "# build wrapper output\n\
             result = ok\n\
             summary = 3 out of 5 tests passed\n\
             \n\
             report = test_report.html\n",
        )
        .unwrap();
        assert_eq!(result.code(), ResultCode::Ok);
        assert_eq!(result.summary(), Some("3 out of 5 tests passed"));
        assert_eq!(result.reports().collect::<Vec<_>>(), ["test_report.html"]);
    }

    #[test]
    fn test_report_priority_alias() {
        let plain = TaskResult::parse("result=ok\nreport=index.html\n").unwrap();
        let explicit = TaskResult::parse("result=ok\nreport.0=index.html\n").unwrap();
        assert_eq!(
            plain.reports().collect::<Vec<_>>(),
            explicit.reports().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_reports_in_priority_order() {
        let result =
            TaskResult::parse("result=ok\nreport.2=low.html\nreport.1=high.html\n").unwrap();
        assert_eq!(
            result.reports().collect::<Vec<_>>(),
            ["high.html", "low.html"]
        );
    }

    #[test]
    fn test_output_locator() {
        let result =
            TaskResult::parse("result=ok\noutput.BINARY.locator=pub/bin.tgz\n").unwrap();
        assert_eq!(
            result.output_locators().get("output.BINARY").map(String::as_str),
            Some("pub/bin.tgz")
        );
    }

    #[test]
    fn test_unsupported_output_property() {
        let err = TaskResult::parse("output.BINARY.size=12\n").unwrap_err();
        assert!(err.to_string().contains("Unsupported output property"));
    }

    #[test]
    fn test_extraction_and_data() {
        let result = TaskResult::parse(
            "extraction.result=warning\ndata.loc=1234\ndata.memfree = 17 MB\n",
        )
        .unwrap();
        assert_eq!(result.extract_code(), ResultCode::Warning);
        assert_eq!(
            result.extracted_data().get("data.loc").map(String::as_str),
            Some("1234")
        );
        assert_eq!(
            result.extracted_data().get("data.memfree").map(String::as_str),
            Some("17 MB")
        );
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = TaskResult::parse("verdict=ok\n").unwrap_err();
        assert!(err.to_string().contains("Don't know how to handle"));
    }

    #[test]
    fn test_code_domain_is_closed() {
        assert!(TaskResult::parse("result=great\n").is_err());
        // "unknown" is the absence of a code, not a value a wrapper may write.
        assert!(TaskResult::parse("result=unknown\n").is_err());
    }

    #[test]
    fn test_bad_priority_rejected() {
        let err = TaskResult::parse("report.first=index.html\n").unwrap_err();
        assert!(err.to_string().contains("Invalid report priority"));
    }

    #[test]
    fn test_bad_syntax_rejected() {
        assert!(TaskResult::parse("this is not a property\n").is_err());
    }

    #[test]
    fn test_whitespace_trimmed() {
        let result = TaskResult::parse("  result  =  ok  \n").unwrap();
        assert_eq!(result.code(), ResultCode::Ok);
    }

    #[test]
    fn test_empty_value_allowed() {
        let result = TaskResult::parse("result=ok\nsummary=\n").unwrap();
        assert_eq!(result.summary(), Some(""));
    }

    #[test]
    fn test_last_assignment_wins() {
        let result = TaskResult::parse("result=warning\nresult=ok\n").unwrap();
        assert_eq!(result.code(), ResultCode::Ok);
    }
}
