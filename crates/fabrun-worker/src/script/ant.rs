//! Generic wrapper for running Ant build files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use fabrun_core::{encode_variables, join, FlatValue, TaskRunError, VarMap, VariableFlattener};

use crate::protocol::xml_escape;
use crate::runlog::RunLog;
use crate::script::{path_str, LanguageRun};

pub struct AntRun {
    wrapper_path: PathBuf,
}

impl AntRun {
    pub fn new(wrapper_path: PathBuf, log: &Arc<RunLog>) -> Self {
        log.info(&format!("AntRun: {}", wrapper_path.display()));
        Self { wrapper_path }
    }
}

impl LanguageRun for AntRun {
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
            |value| value.to_owned(),
            "ant",
            "antfile",
        ));
        Ok(())
    }

    fn startup_command(&self, startup_path: &Path) -> Vec<String> {
        vec!["ant".to_owned(), "-f".to_owned(), path_str(startup_path)]
    }
}

/// Build a `<project>` file defining one `<property>` per flattened variable
/// and invoking the wrapper build file. `rewrite` adjusts property values for
/// the target tool before XML escaping.
pub(crate) fn property_project(
    vars: &VarMap,
    wrapper_path: &str,
    rewrite: impl Fn(&str) -> String,
    invoke_element: &str,
    file_attr: &str,
) -> String {
    let mut flattener = VariableFlattener::new('.');
    encode_variables(vars, &mut flattener);

    let mut out = String::from("<?xml version=\"1.0\"?>\n<project>\n");
    for (name, value) in flattener.into_variables() {
        let text = match value {
            FlatValue::Str(s) => s,
            FlatValue::Seq(items) => join(items, ' '),
        };
        out.push_str(&format!(
            "  <property name=\"{}\" value=\"{}\"/>\n",
            xml_escape(&name),
            xml_escape(&rewrite(&text))
        ));
    }
    out.push_str(&format!(
        "  <{} {}=\"{}\"/>\n</project>\n",
        invoke_element,
        file_attr,
        xml_escape(wrapper_path)
    ));
    out
}
