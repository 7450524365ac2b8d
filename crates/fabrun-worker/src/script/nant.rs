//! Generic wrapper for running NAnt build files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{TaskRunError, VarMap};

use crate::runlog::RunLog;
use crate::script::ant::property_project;
use crate::script::{path_str, LanguageRun};

pub struct NAntRun {
    wrapper_path: PathBuf,
}

impl NAntRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("NAntRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }
}

impl LanguageRun for NAntRun {
    fn wrapper_path(&self) -> &Path {
        &self.wrapper_path
    }

    fn write_startup_script(
        &self,
        vars: &VarMap,
        out: &mut String,
    ) -> Result<(), TaskRunError> {
        out.push_str(&property_project(
            vars,
            &path_str(&self.wrapper_path),
            // Escape "$" so "${" is not treated as an expression evaluation.
            |value| value.replace('$', "${'$'}"),
            "nant",
            "buildfile",
        ));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec![
            "nant".to_owned(),
            format!("-buildfile:{}", path_str(startup_path)),
        ]
    }
}
