//! Dependency resolution: topological levels from declared `depends_on`.
//!
//! A token `a|b` is an OR group: for *layering* it is satisfied as soon as
//! any alternative's level is reached (minimum level among alternatives).
//! Runtime satisfaction of OR groups is the dispatcher's concern and uses
//! committed results, not levels.
//!
//! The planning graph is a DAG; cycles are only ever introduced dynamically
//! through routing, bounded by the loop budget. A static cycle or an
//! undefined reference aborts planning with a structured error that the
//! runner turns into a single `system/error` issue.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use cascade_types::CheckConfig;
use thiserror::Error;

use crate::error::EngineError;

/// One parsed `depends_on` token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DependencyToken {
    pub alternatives: Vec<String>,
}

/// Parse a raw token, splitting OR groups on `|` and dropping empty parts.
pub fn parse_token(raw: &str) -> DependencyToken {
    DependencyToken {
        alternatives: raw
            .split('|')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// The resolved plan: ordered topological levels plus reverse adjacency
/// (dependency -> dependents over all OR alternatives).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Levels {
    pub levels: Vec<Vec<String>>,
    pub reverse: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("dependency cycle detected: {path}")]
    Cycle { path: String },
    #[error("check '{check}' depends on '{reference}' which is not defined")]
    UndefinedReference { check: String, reference: String },
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Assign topological levels to every check, iterating in `order` for
/// deterministic level contents.
///
/// `level(c) = max over tokens of (1 + min over alternatives of level(alt))`,
/// 0 when `depends_on` is empty. A cycle through *any* OR alternative is
/// rejected; layering cannot prove the cyclic alternative unreachable.
pub fn resolve(
    checks: &BTreeMap<String, CheckConfig>,
    order: &[String],
) -> Result<Levels, GraphError> {
    // Reject dangling references before walking, so the error names the
    // offending check rather than wherever the walk first trips over it.
    for id in order {
        let check = &checks[id];
        for raw in &check.depends_on {
            for alt in parse_token(raw).alternatives {
                if !checks.contains_key(&alt) {
                    return Err(GraphError::UndefinedReference {
                        check: id.clone(),
                        reference: alt,
                    });
                }
            }
        }
    }

    let mut levels_by_id: HashMap<String, usize> = HashMap::new();
    let mut marks: HashMap<String, Mark> = HashMap::new();
    let mut stack: Vec<String> = Vec::new();

    for id in order {
        visit(id, checks, &mut levels_by_id, &mut marks, &mut stack)?;
    }

    let depth = levels_by_id.values().copied().max().map_or(0, |max| max + 1);
    let mut levels = vec![Vec::new(); depth];
    for id in order {
        levels[levels_by_id[id]].push(id.clone());
    }

    let mut reverse: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for id in order {
        for raw in &checks[id].depends_on {
            for alt in parse_token(raw).alternatives {
                let dependents = reverse.entry(alt).or_default();
                if !dependents.contains(id) {
                    dependents.push(id.clone());
                }
            }
        }
    }

    Ok(Levels { levels, reverse })
}

fn visit(
    id: &str,
    checks: &BTreeMap<String, CheckConfig>,
    levels_by_id: &mut HashMap<String, usize>,
    marks: &mut HashMap<String, Mark>,
    stack: &mut Vec<String>,
) -> Result<usize, GraphError> {
    match marks.get(id).copied().unwrap_or(Mark::Unvisited) {
        Mark::Done => return Ok(levels_by_id[id]),
        Mark::Visiting => {
            let start = stack.iter().position(|seen| seen == id).unwrap_or(0);
            let mut path: Vec<&str> = stack[start..].iter().map(String::as_str).collect();
            path.push(id);
            return Err(GraphError::Cycle {
                path: path.join(" -> "),
            });
        }
        Mark::Unvisited => {}
    }

    marks.insert(id.to_string(), Mark::Visiting);
    stack.push(id.to_string());

    let mut level = 0usize;
    for raw in &checks[id].depends_on {
        let token = parse_token(raw);
        let mut token_level: Option<usize> = None;
        for alt in &token.alternatives {
            let alt_level = visit(alt, checks, levels_by_id, marks, stack)?;
            token_level = Some(token_level.map_or(alt_level, |best| best.min(alt_level)));
        }
        if let Some(token_level) = token_level {
            level = level.max(token_level + 1);
        }
    }

    stack.pop();
    marks.insert(id.to_string(), Mark::Done);
    levels_by_id.insert(id.to_string(), level);
    Ok(level)
}

/// Expand a requested subset to its transitive dependency closure (over all
/// OR alternatives). An empty request selects every configured check.
pub fn expand_subset(
    checks: &BTreeMap<String, CheckConfig>,
    requested: &[String],
) -> Result<BTreeSet<String>, EngineError> {
    if requested.is_empty() {
        return Ok(checks.keys().cloned().collect());
    }

    let mut selected = BTreeSet::new();
    let mut pending: Vec<String> = Vec::new();
    for id in requested {
        if !checks.contains_key(id) {
            return Err(EngineError::UnknownRequestedCheck(id.clone()));
        }
        pending.push(id.clone());
    }

    while let Some(id) = pending.pop() {
        if !selected.insert(id.clone()) {
            continue;
        }
        for raw in &checks[&id].depends_on {
            for alt in parse_token(raw).alternatives {
                if checks.contains_key(&alt) && !selected.contains(&alt) {
                    pending.push(alt);
                }
            }
        }
    }

    Ok(selected)
}
