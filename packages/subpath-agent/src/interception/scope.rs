// packages/subpath-agent/src/interception/scope.rs
//! Interception scope
//!
//! A scope is the path prefix a service is deployed under behind the proxy,
//! e.g. `/user/alice/proxy/8080/`. It always starts and ends with `/` and is
//! fixed for the lifetime of an agent.

use crate::utils::errors::{AgentError, Result};
use std::fmt;

/// Placeholder substituted by [`Scope::from_template`]
pub const PORT_PLACEHOLDER: &str = "{{port}}";

/// Validated path prefix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    path: String,
    segments: Vec<String>,
}

impl Scope {
    pub fn new(path: impl Into<String>) -> Result<Self> {
        let path = path.into();
        if !path.starts_with('/') || !path.ends_with('/') {
            return Err(AgentError::InvalidScope(path));
        }

        let segments = split_segments(&path)
            .into_iter()
            .map(str::to_string)
            .collect();

        Ok(Self { path, segments })
    }

    /// Resolve a proxy URL template such as `/proxy/{{port}}/`
    ///
    /// Absolute templates (`https://host/proxy/{{port}}/`) contribute only
    /// their path.
    pub fn from_template(template: &str, port: u16) -> Result<Self> {
        let resolved = template.replace(PORT_PLACEHOLDER, &port.to_string());
        let path = match resolved.find("://") {
            Some(idx) => {
                let after_scheme = &resolved[idx + 3..];
                match after_scheme.find('/') {
                    Some(slash) => after_scheme[slash..].to_string(),
                    None => "/".to_string(),
                }
            }
            None => resolved,
        };

        let path = if path.starts_with('/') { path } else { format!("/{}", path) };
        let path = if path.ends_with('/') { path } else { format!("{}/", path) };
        Self::new(path)
    }

    pub fn as_str(&self) -> &str {
        &self.path
    }

    /// Scope without its trailing slash (`/` stays `""`)
    pub fn base(&self) -> &str {
        &self.path[..self.path.len() - 1]
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `path` lies inside the scope (or is the scope without its slash)
    pub fn contains(&self, path: &str) -> bool {
        path.starts_with(&self.path) || path == self.base()
    }

    /// Number of leading path segments shared with the scope
    pub fn common_prefix_len<S: AsRef<str>>(&self, path_segments: &[S]) -> usize {
        self.segments
            .iter()
            .zip(path_segments.iter())
            .take_while(|(scope, path)| scope.as_str() == path.as_ref())
            .count()
    }

    /// Derive the target port from the agent's own resource path
    ///
    /// The directory of `agent_path` and the scope must differ in exactly one
    /// segment, and the scope's segment at that position must be a port.
    pub fn target_port(&self, agent_path: &str) -> Result<u16> {
        let directory = match agent_path.rfind('/') {
            Some(idx) => &agent_path[..=idx],
            None => "/",
        };
        let agent_segments = split_segments(directory);

        if agent_segments.len() != self.segments.len() {
            return Err(AgentError::PortExtraction(format!(
                "agent path '{}' and scope '{}' have different depths",
                agent_path, self.path
            )));
        }

        let differing: Vec<usize> = agent_segments
            .iter()
            .zip(self.segments.iter())
            .enumerate()
            .filter(|(_, (agent, scope))| **agent != scope.as_str())
            .map(|(idx, _)| idx)
            .collect();

        match differing.as_slice() {
            [idx] => match self.segments[*idx].parse::<u16>() {
                Ok(port) if port >= 1 => Ok(port),
                _ => Err(AgentError::PortExtraction(format!(
                    "segment '{}' is not a port",
                    self.segments[*idx]
                ))),
            },
            [] => Err(AgentError::PortExtraction(format!(
                "agent path '{}' does not differ from scope '{}'",
                agent_path, self.path
            ))),
            many => Err(AgentError::PortExtraction(format!(
                "agent path '{}' differs from scope '{}' in {} segments",
                agent_path,
                self.path,
                many.len()
            ))),
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path)
    }
}

/// Non-empty `/`-delimited segments
pub fn split_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}
