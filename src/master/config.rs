//! Master configuration from `zeus.json`
//!
//! ```json
//! {
//!   "command": "ruby -rzeus/rails -eZeus.go",
//!   "plan": {
//!     "boot": {
//!       "default_bundle": {
//!         "development_environment": { "prerake": { "rake": [] }, "console": ["c"] },
//!         "test_environment": { "test_helper": { "test": ["rspec", "testrb"] } }
//!       }
//!     }
//!   },
//!   "ignore": ["coverage/**"]
//! }
//! ```
//!
//! Inside `plan`, an object is a slave (its entries are nested slaves or
//! commands) and an array is a command owned by the enclosing slave, listing
//! the command's aliases.

use crate::error::ConfigError;
use crate::master::tree::{ProcessTree, SlaveNode};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::sync::Arc;

/// Default config file name, relative to the project directory
pub const CONFIG_FILE: &str = "zeus.json";

/// Paths the file monitor never reports
pub const DEFAULT_IGNORE: &[&str] = &[".git/**", "log/**", "tmp/**", ".zeus.sock"];

#[derive(Debug, Deserialize)]
struct RawConfig {
    command: Option<String>,
    plan: Option<Map<String, Value>>,
    #[serde(default)]
    ignore: Vec<String>,
}

/// Everything the master needs from `zeus.json`
#[derive(Debug)]
pub struct MasterConfig {
    /// Shell command that boots a slave process
    pub command: String,
    pub tree: ProcessTree,
    /// Glob patterns (relative to the project root) the file monitor skips
    pub ignore: Vec<String>,
}

impl MasterConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(content)?;

        let command = raw
            .command
            .filter(|c| !c.trim().is_empty())
            .ok_or(ConfigError::Missing("command"))?;
        let plan = raw
            .plan
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::Missing("plan"))?;

        let mut tree = ProcessTree::new();
        build_plan(&mut tree, None, &plan)?;

        let mut ignore: Vec<String> = DEFAULT_IGNORE.iter().map(|s| s.to_string()).collect();
        ignore.extend(raw.ignore);

        Ok(Self {
            command,
            tree,
            ignore,
        })
    }
}

fn build_plan(
    tree: &mut ProcessTree,
    parent: Option<&Arc<SlaveNode>>,
    entries: &Map<String, Value>,
) -> Result<(), ConfigError> {
    for (name, value) in entries {
        match (value, parent) {
            (Value::Object(children), _) => {
                let slave = tree.add_slave(name.clone());
                build_plan(tree, Some(&slave), children)?;
            }
            (Value::Array(aliases), Some(slave)) => {
                let aliases = aliases
                    .iter()
                    .map(|alias| match alias {
                        Value::String(s) => Ok(s.clone()),
                        other => Err(ConfigError::InvalidAlias {
                            command: name.clone(),
                            alias: other.to_string(),
                        }),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                tree.add_command(name.clone(), aliases, slave)?;
            }
            _ => return Err(ConfigError::InvalidPlanEntry(name.clone())),
        }
    }
    Ok(())
}
