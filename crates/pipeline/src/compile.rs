//! Registration set maintenance and the ordering algorithm.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{Chain, Interceptor, WILDCARD};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileError {
    #[error("conflicting interceptor {name}: {reason}")]
    Conflict { name: String, reason: String },
    #[error("interceptor ordering cycle: {path}")]
    Cycle { path: String },
    #[error("interceptor {0} registered without a handler")]
    MissingHandler(String),
}

pub(crate) struct Entry<S> {
    pub name: String,
    pub handler: Arc<dyn Interceptor<S>>,
    pub before: Option<String>,
    pub after: Option<String>,
}

impl<S> Clone for Entry<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            handler: Arc::clone(&self.handler),
            before: self.before.clone(),
            after: self.after.clone(),
        }
    }
}

pub(crate) enum Registration<S> {
    /// With `replace`, an existing entry of that name keeps its slot and constraints.
    Add { entry: Entry<S>, replace: bool },
    Remove(String),
}

fn is_wildcard(target: &Option<String>) -> bool {
    target.as_deref() == Some(WILDCARD)
}

/// Processing rank: `before="*"` first, `after="*"` last, everything else in insertion order.
fn rank<S>(e: &Entry<S>) -> u8 {
    if is_wildcard(&e.before) {
        0
    } else if is_wildcard(&e.after) {
        2
    } else {
        1
    }
}

/// Apply one registration to the current set and compile the result.
/// Returns the compacted set and its chain; the inputs are untouched on error.
pub(crate) fn compile<S>(current: &[Entry<S>], next: Registration<S>) -> Result<(Vec<Entry<S>>, Chain<S>), CompileError> {
    let mut entries: Vec<Entry<S>> = current.to_vec();
    match next {
        Registration::Remove(name) => entries.retain(|e| e.name != name),
        Registration::Add { entry: mut e, replace } => match entries.iter_mut().find(|x| x.name == e.name) {
            Some(existing) => {
                if !replace {
                    warn!(name = %e.name, "duplicate interceptor name; later registration wins");
                    if e.before.is_some() { existing.before = e.before.take(); }
                    if e.after.is_some() { existing.after = e.after.take(); }
                }
                existing.handler = e.handler;
            }
            None => entries.push(e),
        },
    }

    let order = placement(&entries)?;
    let chain = Chain { entries: order.iter().map(|&i| (entries[i].name.clone(), Arc::clone(&entries[i].handler))).collect() };
    Ok((entries, chain))
}

/// Compute execution order as indices into `entries`.
///
/// Each entry is placed after all of its predecessors, visited depth-first in processing order:
/// `a.before = b` makes `a` a predecessor of `b`, `a.after = b` makes `b` a predecessor of `a`,
/// and every `before="*"` entry precedes every entry without that flag. Unknown targets are
/// ignored. A predecessor reached while it is still being placed is a cycle.
fn placement<S>(entries: &[Entry<S>]) -> Result<Vec<usize>, CompileError> {
    let n = entries.len();
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by_key(|&i| rank(&entries[i]));
    let mut position = vec![0usize; n];
    for (pos, &i) in order.iter().enumerate() {
        position[i] = pos;
    }

    let index: HashMap<&str, usize> = entries.iter().enumerate().map(|(i, e)| (e.name.as_str(), i)).collect();
    let mut preds: Vec<Vec<usize>> = vec![Vec::new(); n];
    for (i, e) in entries.iter().enumerate() {
        if let Some(target) = e.before.as_deref().filter(|t| *t != WILDCARD) {
            match index.get(target) {
                Some(&j) if j == i => {
                    return Err(CompileError::Conflict { name: e.name.clone(), reason: "ordered before itself".into() })
                }
                Some(&j) => preds[j].push(i),
                None => debug!(name = %e.name, before = %target, "before target not registered; ignoring"),
            }
        }
        if let Some(target) = e.after.as_deref().filter(|t| *t != WILDCARD) {
            match index.get(target) {
                Some(&j) if j == i => {
                    return Err(CompileError::Conflict { name: e.name.clone(), reason: "ordered after itself".into() })
                }
                Some(&j) => preds[i].push(j),
                None => debug!(name = %e.name, after = %target, "after target not registered; ignoring"),
            }
        }
    }
    let leading: Vec<usize> = order.iter().copied().filter(|&i| rank(&entries[i]) == 0).collect();
    for (i, p) in preds.iter_mut().enumerate() {
        if rank(&entries[i]) != 0 {
            p.extend(leading.iter().copied());
        }
        p.sort_by_key(|&j| position[j]);
        p.dedup();
    }

    let mut placer = Placer { entries, preds: &preds, placed: vec![false; n], visiting: vec![false; n], path: Vec::new(), out: Vec::with_capacity(n) };
    for &i in &order {
        placer.visit(i)?;
    }
    Ok(placer.out)
}

struct Placer<'a, S> {
    entries: &'a [Entry<S>],
    preds: &'a [Vec<usize>],
    placed: Vec<bool>,
    visiting: Vec<bool>,
    path: Vec<usize>,
    out: Vec<usize>,
}

impl<S> Placer<'_, S> {
    fn visit(&mut self, i: usize) -> Result<(), CompileError> {
        if self.placed[i] {
            return Ok(());
        }
        if self.visiting[i] {
            let start = self.path.iter().position(|&p| p == i).unwrap_or(0);
            let mut names: Vec<&str> = self.path[start..].iter().map(|&p| self.entries[p].name.as_str()).collect();
            names.push(self.entries[i].name.as_str());
            return Err(CompileError::Cycle { path: names.join(" -> ") });
        }
        self.visiting[i] = true;
        self.path.push(i);
        let preds = self.preds;
        for &p in &preds[i] {
            self.visit(p)?;
        }
        self.path.pop();
        self.visiting[i] = false;
        self.placed[i] = true;
        self.out.push(i);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait::async_trait]
    impl Interceptor<()> for Noop {
        async fn handle(&self, _stmt: &mut ()) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn entry(name: &str, before: Option<&str>, after: Option<&str>) -> Entry<()> {
        Entry { name: name.into(), handler: Arc::new(Noop), before: before.map(Into::into), after: after.map(Into::into) }
    }

    fn names(entries: &[Entry<()>]) -> Result<Vec<String>, CompileError> {
        Ok(placement(entries)?.into_iter().map(|i| entries[i].name.clone()).collect())
    }

    #[test]
    fn before_target_already_placed_inserts_ahead() {
        let e = vec![entry("a", None, None), entry("b", None, None), entry("c", Some("a"), None)];
        assert_eq!(names(&e).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn after_pending_target_is_placed_first() {
        let e = vec![entry("audit", None, Some("log")), entry("log", None, None)];
        assert_eq!(names(&e).unwrap(), vec!["log", "audit"]);
    }

    #[test]
    fn after_wildcard_anchors_at_end() {
        let e = vec![entry("tail", None, Some("*")), entry("x", None, None), entry("y", None, None)];
        assert_eq!(names(&e).unwrap(), vec!["x", "y", "tail"]);
    }

    #[test]
    fn missing_targets_are_ignored() {
        let e = vec![entry("a", Some("ghost"), None), entry("b", None, Some("phantom"))];
        assert_eq!(names(&e).unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn self_reference_is_a_conflict() {
        let e = vec![entry("a", Some("a"), None)];
        assert!(matches!(names(&e), Err(CompileError::Conflict { .. })));
    }

    #[test]
    fn direct_cycle_reports_path() {
        let e = vec![entry("a", Some("b"), None), entry("b", Some("a"), None)];
        match names(&e) {
            Err(CompileError::Cycle { path }) => assert!(path == "a -> b -> a" || path == "b -> a -> b", "path={}", path),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn wildcard_before_entry_cannot_follow_a_plain_one() {
        let e = vec![entry("auth", Some("*"), Some("log")), entry("log", None, None)];
        assert!(matches!(names(&e), Err(CompileError::Cycle { .. })));
    }

    #[test]
    fn remove_drops_all_matching_entries() {
        let current = vec![entry("a", None, None), entry("b", None, None)];
        let (next, chain) = compile(&current, Registration::Remove("a".into())).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(chain.names(), vec!["b"]);
    }

    #[test]
    fn duplicate_keeps_slot_and_takes_new_constraints() {
        let current = vec![entry("a", None, None), entry("b", None, None)];
        let (next, chain) = compile(&current, Registration::Add { entry: entry("b", Some("a"), None), replace: false }).unwrap();
        assert_eq!(next.len(), 2);
        assert_eq!(chain.names(), vec!["b", "a"]);
    }

    #[test]
    fn replace_keeps_existing_constraints() {
        let current = vec![entry("a", None, None), entry("b", Some("a"), None)];
        let (next, chain) = compile(&current, Registration::Add { entry: entry("b", None, Some("a")), replace: true }).unwrap();
        assert_eq!(next[1].before.as_deref(), Some("a"));
        assert_eq!(next[1].after, None);
        assert_eq!(chain.names(), vec!["b", "a"]);
    }
}
