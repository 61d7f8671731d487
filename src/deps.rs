//! Dependency manifest resolution.
//!
//! A manifest lists the handler runtimes an installation expects, one per
//! line: `name`, `name==version` or `name>=version`. Resolution checks each
//! line against the runtimes compiled into this server before any model is
//! loaded.

use std::cmp::Ordering;
use std::path::Path;

use crate::error::{Result, ServeError};
use crate::handler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionReq {
    Any,
    Exact(String),
    AtLeast(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub name: String,
    pub version: VersionReq,
    pub line: usize,
}

/// A requirement matched to the runtime that satisfies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub name: String,
    pub version: &'static str,
}

pub fn parse_manifest(content: &str) -> Result<Vec<Requirement>> {
    let mut requirements = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }

        let (name, version) = if let Some((name, v)) = line.split_once("==") {
            (name, VersionReq::Exact(v.trim().to_string()))
        } else if let Some((name, v)) = line.split_once(">=") {
            (name, VersionReq::AtLeast(v.trim().to_string()))
        } else {
            (line, VersionReq::Any)
        };

        let name = name.trim();
        let malformed = name.is_empty()
            || name.chars().any(|c| c.is_whitespace() || "<>=!~".contains(c))
            || matches!(&version, VersionReq::Exact(v) | VersionReq::AtLeast(v) if parse_version(v).is_none());
        if malformed {
            return Err(ServeError::DependencyResolution(format!(
                "line {}: cannot parse requirement '{}'",
                idx + 1,
                raw.trim()
            )));
        }

        requirements.push(Requirement {
            name: name.to_string(),
            version,
            line: idx + 1,
        });
    }

    Ok(requirements)
}

/// Resolve every requirement against the available runtimes.
pub fn resolve(
    requirements: &[Requirement],
    available: &[(&'static str, &'static str)],
) -> Result<Vec<Resolved>> {
    requirements
        .iter()
        .map(|req| {
            let (name, version) = available
                .iter()
                .find(|(name, _)| *name == req.name)
                .ok_or_else(|| {
                    ServeError::DependencyResolution(format!(
                        "line {}: no handler runtime named '{}'",
                        req.line, req.name
                    ))
                })?;

            let satisfied = match &req.version {
                VersionReq::Any => true,
                VersionReq::Exact(want) => compare_versions(version, want) == Some(Ordering::Equal),
                VersionReq::AtLeast(min) => matches!(
                    compare_versions(version, min),
                    Some(Ordering::Greater | Ordering::Equal)
                ),
            };

            if !satisfied {
                return Err(ServeError::DependencyResolution(format!(
                    "line {}: '{}' is at version {}, which does not satisfy {:?}",
                    req.line, req.name, version, req.version
                )));
            }

            Ok(Resolved {
                name: name.to_string(),
                version,
            })
        })
        .collect()
}

/// Read, parse and resolve a manifest file against the built-in runtimes.
pub fn resolve_manifest(path: &Path) -> Result<Vec<Resolved>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ServeError::DependencyResolution(format!("cannot read {}: {}", path.display(), e))
    })?;
    let requirements = parse_manifest(&content)?;
    let resolved = resolve(&requirements, handler::RUNTIMES)?;

    for dep in &resolved {
        tracing::info!(name = %dep.name, version = dep.version, "Resolved dependency");
    }
    Ok(resolved)
}

fn parse_version(v: &str) -> Option<Vec<u64>> {
    v.split('.').map(|part| part.parse().ok()).collect()
}

/// Compare dotted numeric versions, padding the shorter one with zeros.
fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let mut a = parse_version(a)?;
    let mut b = parse_version(b)?;
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}
