//! Generic wrapper for running Windows batch files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{join, TaskRunError, VarMap};

use crate::runlog::RunLog;
use crate::script::{path_str, write_flattened, FlatFormat, LanguageRun};

pub struct BatchRun {
    wrapper_path: PathBuf,
}

impl BatchRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("BatchRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }

    fn quote(value: &str) -> String {
        // Quotes have to be explicitly removed in the batch file, so only use
        // them when the value contains characters cmd would interpret.
        if value.chars().any(|c| "&|><^".contains(c)) {
            format!("\"{value}\"")
        } else {
            value.to_owned()
        }
    }

    fn encode_seq(items: &[String]) -> String {
        let encoded: Vec<String> = items
            .iter()
            .map(|item| {
                if item.contains(' ') {
                    format!("\"{item}\"")
                } else {
                    Self::quote(item)
                }
            })
            .collect();
        join(encoded, ' ')
    }
}

impl LanguageRun for BatchRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        out.push_str("@echo off\n");
        write_flattened(
            vars,
            &FlatFormat {
                line_prefix: "set ",
                quote: &Self::quote,
                encode_seq: &Self::encode_seq,
            },
            out,
        );
        out.push_str(&format!("\"{}\"\n", path_str(&self.wrapper_path)));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![path_str(startup_path)]
    }
}
