//! Worker configuration.
//!
//! The configuration file is an XML document with one record type per
//! section; each record is unmarshalled by hand from its element. Unknown
//! sections and missing attributes are errors: a Factory PC with a half-read
//! configuration is worse than one that refuses to start.

use std::path::{Path, PathBuf};

use clap::Parser;
use lazy_static::lazy_static;
use regex::Regex;
use roxmltree::Node;
use thiserror::Error;

lazy_static! {
    static ref PARAM_NAME: Regex =
        Regex::new(r"^[A-Za-z_][A-Za-z_0-9]*$").expect("parameter name pattern");
}

/// Factory-PC task runner agent for a central Control Center.
#[derive(Debug, Parser)]
#[command(name = "fabrun-worker", version)]
pub struct Cli {
    /// Path to the XML configuration file.
    #[arg(default_value = "config.xml")]
    pub config: PathBuf,

    /// Log level override (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Error reading configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Error parsing configuration file: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        ConfigError::Invalid(message.into())
    }
}

/// Root configuration record.
#[derive(Debug, Clone)]
pub struct Config {
    pub control_center: ControlCenterConfig,
    pub output: OutputConfig,
    pub generic: GenericConfig,

    /// Wrapper base directories of this Factory PC, in search order.
    pub wrappers: Vec<PathBuf>,

    /// Local parameters of this Factory PC, in file order.
    pub parameters: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct ControlCenterConfig {
    /// Base URL of the Control Center; always ends with `/`.
    pub server_base_url: String,

    /// Access token this Task Runner authenticates with.
    pub token_id: String,
    pub token_pass: String,
}

#[derive(Debug, Clone)]
pub struct OutputConfig {
    /// Directory under which per-run report directories are created.
    pub report_base_dir: PathBuf,

    /// Directory where created products are stored.
    pub product_base_dir: PathBuf,

    /// Public URL under which the report directories are served, if any.
    pub report_base_url: Option<String>,

    /// Public URL under which the product directories are served, if any.
    pub product_base_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GenericConfig {
    /// File to duplicate the operator log to.
    pub log_file: Option<PathBuf>,

    /// Log level for the operator log.
    pub log_level: String,

    /// Command prepended to every wrapper invocation.
    pub process_wrapper: Option<String>,
}

impl Config {
    /// Read and validate the configuration file at `path`.
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config = Config::parse(&text)?;
        config.check_directories()?;
        Ok(config)
    }

    /// Parse configuration XML without touching the filesystem.
    pub fn parse(text: &str) -> Result<Config, ConfigError> {
        let document = roxmltree::Document::parse(text)?;
        let root = document.root_element();

        let mut control_center = None;
        let mut output = None;
        let mut generic = None;
        let mut wrappers = Vec::new();
        let mut parameters: Vec<(String, String)> = Vec::new();

        for child in root.children().filter(Node::is_element) {
            match child.tag_name().name() {
                "controlCenter" => {
                    control_center = Some(ControlCenterConfig::from_node(&child)?);
                }
                "output" => {
                    output = Some(OutputConfig::from_node(&child)?);
                }
                "generic" => {
                    generic = Some(GenericConfig::from_node(&child)?);
                }
                "wrappers" => {
                    wrappers.push(PathBuf::from(require_attr(&child, "dir")?));
                }
                "parameter" => {
                    let name = require_attr(&child, "name")?.to_owned();
                    let value = require_attr(&child, "value")?.to_owned();
                    if !PARAM_NAME.is_match(&name) {
                        return Err(ConfigError::invalid(format!(
                            "Invalid parameter name \"{name}\""
                        )));
                    }
                    if parameters.iter().any(|(n, _)| *n == name) {
                        return Err(ConfigError::invalid(format!(
                            "Duplicate parameter: {name}"
                        )));
                    }
                    parameters.push((name, value));
                }
                other => {
                    return Err(ConfigError::invalid(format!(
                        "Unknown configuration section <{other}>"
                    )));
                }
            }
        }

        let config = Config {
            control_center: control_center
                .ok_or_else(|| ConfigError::invalid("Missing <controlCenter> section"))?,
            output: output.ok_or_else(|| ConfigError::invalid("Missing <output> section"))?,
            generic: generic.ok_or_else(|| ConfigError::invalid("Missing <generic> section"))?,
            wrappers,
            parameters,
        };
        if config.wrappers.is_empty() {
            return Err(ConfigError::invalid("Missing <wrappers> tag"));
        }
        Ok(config)
    }

    fn check_directories(&self) -> Result<(), ConfigError> {
        check_directory(&self.output.report_base_dir, "reportBaseDir")?;
        check_directory(&self.output.product_base_dir, "productBaseDir")?;
        for dir in &self.wrappers {
            check_directory(dir, "dir")?;
        }
        Ok(())
    }
}

impl ControlCenterConfig {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ConfigError> {
        let mut server_base_url = require_attr(node, "serverBaseURL")?.to_owned();
        if !server_base_url.ends_with('/') {
            server_base_url.push('/');
        }
        Ok(Self {
            server_base_url,
            token_id: require_attr(node, "tokenId")?.to_owned(),
            token_pass: require_attr(node, "tokenPass")?.to_owned(),
        })
    }
}

impl OutputConfig {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ConfigError> {
        Ok(Self {
            report_base_dir: PathBuf::from(aliased_attr(node, "reportBaseDir", "reportDir")?),
            product_base_dir: PathBuf::from(aliased_attr(node, "productBaseDir", "productDir")?),
            report_base_url: optional_attr(node, "reportBaseURL"),
            product_base_url: optional_attr(node, "productBaseURL"),
        })
    }
}

impl GenericConfig {
    fn from_node(node: &Node<'_, '_>) -> Result<Self, ConfigError> {
        Ok(Self {
            log_file: optional_attr(node, "logFile").map(PathBuf::from),
            log_level: require_attr(node, "logLevel")?.to_owned(),
            process_wrapper: optional_attr(node, "processWrapper"),
        })
    }
}

fn require_attr<'a>(node: &Node<'a, '_>, name: &str) -> Result<&'a str, ConfigError> {
    node.attribute(name).ok_or_else(|| {
        ConfigError::invalid(format!(
            "Missing attribute \"{name}\" in <{}>",
            node.tag_name().name()
        ))
    })
}

/// Attribute with a legacy spelling kept for old configuration files.
fn aliased_attr<'a>(
    node: &Node<'a, '_>,
    name: &str,
    legacy: &str,
) -> Result<&'a str, ConfigError> {
    match node.attribute(name).or_else(|| node.attribute(legacy)) {
        Some(value) => Ok(value),
        None => require_attr(node, name),
    }
}

/// Absent and empty attributes are both "not configured".
fn optional_attr(node: &Node<'_, '_>, name: &str) -> Option<String> {
    node.attribute(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

fn check_directory(path: &Path, what: &str) -> Result<(), ConfigError> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(ConfigError::invalid(format!(
            "{what} \"{}\" is not an existing directory",
            path.display()
        )))
    }
}
