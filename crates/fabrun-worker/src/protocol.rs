//! Task run descriptors received from the Control Center.
//!
//! The `<start>` and `<extract>` commands carry a full description of the
//! task to run. Like the configuration, descriptors are unmarshalled by one
//! constructor per record type; the element and attribute names are fixed by
//! the coordinator protocol.

use std::collections::{BTreeMap, BTreeSet};

use roxmltree::Node;
use thiserror::Error;

use fabrun_core::RunIdent;

/// A malformed server response or task descriptor. The sync loop logs these
/// and keeps going; they usually mean the Control Center speaks a different
/// protocol version.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ProtocolError(String);

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Everything needed to run one task.
#[derive(Debug, Clone)]
pub struct TaskRunInfo {
    pub run: RunIdent,
    pub task: TaskInfo,

    /// Products that serve as input to the task, by product name.
    pub inputs: BTreeMap<String, InputInfo>,

    /// Names of products the task produces.
    pub outputs: BTreeSet<String>,

    pub kind: RunKindInfo,
}

/// What distinguishes an execution run from an extraction ("shadow") run.
#[derive(Debug, Clone)]
pub enum RunKindInfo {
    Execute {
        /// Resources reserved for the run, in reservation order.
        resources: Vec<ResourceInfo>,
    },
    Extract {
        shadow_id: String,
    },
}

/// Task target, script and parameters.
#[derive(Debug, Clone)]
pub struct TaskInfo {
    pub target: String,
    pub framework: String,
    pub script: String,
    pub parameters: BTreeMap<String, String>,
}

/// A collection of information about an input product.
#[derive(Debug, Clone)]
pub struct InputInfo {
    pub name: String,
    pub locator: String,

    /// Producers of this combined product; empty for plain products.
    pub producers: BTreeMap<String, ProducerInfo>,
}

impl InputInfo {
    pub fn is_combined(&self) -> bool {
        !self.producers.is_empty()
    }
}

/// One task that produced an instance of a combined product.
#[derive(Debug, Clone)]
pub struct ProducerInfo {
    pub task_id: String,
    pub locator: String,
    /// Result of the producing task; opaque (the Control Center may send
    /// placeholders such as `notyet`).
    pub result: String,
}

/// A resource reserved for an execution run.
#[derive(Debug, Clone)]
pub struct ResourceInfo {
    pub reference: String,
    pub locator: String,
    pub parameters: BTreeMap<String, String>,
}

impl TaskRunInfo {
    /// Parse a `<start>` command into an execution descriptor.
    pub fn parse_execute(node: &Node<'_, '_>) -> Result<Self, ProtocolError> {
        let mut resources = Vec::new();
        let info = Self::parse_common(node, |child| match child.tag_name().name() {
            "resource" => {
                resources.push(ResourceInfo::from_node(child)?);
                Ok(true)
            }
            _ => Ok(false),
        })?;
        Ok(Self {
            kind: RunKindInfo::Execute { resources },
            ..info
        })
    }

    /// Parse an `<extract>` command into an extraction descriptor.
    pub fn parse_extract(node: &Node<'_, '_>) -> Result<Self, ProtocolError> {
        let mut shadow_id = None;
        let info = Self::parse_common(node, |child| match child.tag_name().name() {
            "shadowrun" => {
                shadow_id = Some(require_attr(child, "shadowId")?.to_owned());
                Ok(true)
            }
            _ => Ok(false),
        })?;
        let shadow_id = shadow_id
            .ok_or_else(|| ProtocolError::new("Missing <shadowrun> in <extract> command"))?;
        Ok(Self {
            kind: RunKindInfo::Extract { shadow_id },
            ..info
        })
    }

    /// Parse the children shared by both descriptor kinds. `extra` handles
    /// kind-specific elements and reports whether it consumed the child.
    fn parse_common(
        node: &Node<'_, '_>,
        mut extra: impl FnMut(&Node<'_, '_>) -> Result<bool, ProtocolError>,
    ) -> Result<Self, ProtocolError> {
        let mut run = None;
        let mut task = None;
        let mut inputs = BTreeMap::new();
        let mut outputs = BTreeSet::new();

        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "run" => {
                    run = Some(RunIdent::new(
                        require_attr(&child, "jobId")?,
                        require_attr(&child, "taskId")?,
                        require_attr(&child, "runId")?,
                    ));
                }
                "task" => {
                    task = Some(TaskInfo::from_node(&child)?);
                }
                "input" => {
                    let input = InputInfo::from_node(&child)?;
                    inputs.insert(input.name.clone(), input);
                }
                "output" => {
                    outputs.insert(require_attr(&child, "name")?.to_owned());
                }
                other => {
                    if !extra(&child)? {
                        return Err(ProtocolError::new(format!(
                            "Unexpected element <{other}> in <{}> command",
                            node.tag_name().name()
                        )));
                    }
                }
            }
        }

        Ok(Self {
            run: run.ok_or_else(|| ProtocolError::new("Missing <run> element"))?,
            task: task.ok_or_else(|| ProtocolError::new("Missing <task> element"))?,
            inputs,
            outputs,
            // Placeholder; the callers fill in the actual kind.
            kind: RunKindInfo::Execute {
                resources: Vec::new(),
            },
        })
    }

    /// Identity fragment for the sync request body.
    pub fn run_id_xml(&self) -> String {
        match &self.kind {
            RunKindInfo::Execute { .. } => format!(
                "<run jobId=\"{}\" taskId=\"{}\" runId=\"{}\"/>",
                xml_escape(&self.run.job_id),
                xml_escape(&self.run.task_id),
                xml_escape(&self.run.run_id),
            ),
            RunKindInfo::Extract { shadow_id } => {
                format!("<shadowrun shadowId=\"{}\"/>", xml_escape(shadow_id))
            }
        }
    }

    /// "execution" or "extraction", for log messages.
    pub fn action_text(&self) -> &'static str {
        match self.kind {
            RunKindInfo::Execute { .. } => "execution",
            RunKindInfo::Extract { .. } => "extraction",
        }
    }

    /// The wrapper chosen by the Control Center, from the reserved
    /// `sf.wrapper` parameter.
    pub fn wrapper_name(&self) -> Option<&str> {
        self.task.parameters.get("sf.wrapper").map(String::as_str)
    }
}

impl TaskInfo {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            target: require_attr(node, "target")?.to_owned(),
            framework: require_attr(node, "framework")?.to_owned(),
            script: require_attr(node, "script")?.to_owned(),
            parameters: parse_params(node)?,
        })
    }
}

impl InputInfo {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ProtocolError> {
        let mut producers = BTreeMap::new();
        for child in node.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "producer" => {
                    let producer = ProducerInfo {
                        task_id: require_attr(&child, "taskId")?.to_owned(),
                        locator: require_attr(&child, "locator")?.to_owned(),
                        result: require_attr(&child, "result")?.to_owned(),
                    };
                    if producers
                        .insert(producer.task_id.clone(), producer)
                        .is_some()
                    {
                        return Err(ProtocolError::new("Duplicate producer"));
                    }
                }
                other => {
                    return Err(ProtocolError::new(format!(
                        "Unexpected element <{other}> in <input>"
                    )));
                }
            }
        }
        Ok(Self {
            name: require_attr(node, "name")?.to_owned(),
            locator: require_attr(node, "locator")?.to_owned(),
            producers,
        })
    }
}

impl ResourceInfo {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ProtocolError> {
        Ok(Self {
            reference: require_attr(node, "ref")?.to_owned(),
            locator: require_attr(node, "locator")?.to_owned(),
            parameters: parse_params(node)?,
        })
    }
}

fn parse_params(node: &Node<'_, '_>) -> Result<BTreeMap<String, String>, ProtocolError> {
    let mut parameters = BTreeMap::new();
    for child in node.children().filter(Node::is_element) {
        if child.tag_name().name() != "param" {
            continue;
        }
        let name = require_attr(&child, "name")?.to_owned();
        let value = require_attr(&child, "value")?.to_owned();
        if parameters.insert(name.clone(), value).is_some() {
            return Err(ProtocolError::new(format!("Duplicate parameter: {name}")));
        }
    }
    Ok(parameters)
}

fn require_attr<'a>(node: &Node<'a, '_>, name: &str) -> Result<&'a str, ProtocolError> {
    node.attribute(name).ok_or_else(|| {
        ProtocolError::new(format!(
            "Missing attribute \"{name}\" in <{}>",
            node.tag_name().name()
        ))
    })
}

/// Escape a string for use in XML attribute values and text.
pub fn xml_escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}
