//! CV-012: Concurrent dependency-ordered walks.
//!
//! A vertex is dispatched once every one of its dependencies has completed.
//! Callbacks run on a rayon pool; results come back over a channel to a
//! single scheduler loop that owns all bookkeeping:
//!
//! 1. Count unfinished dependencies per vertex.
//! 2. Dispatch every vertex whose count is zero.
//! 3. On completion, store the result and decrement the counts of its dependents.
//! 4. On the first error, cancel the walk and stop dispatching.
//!
//! The channel hand-off orders each dependency's completion before any
//! dependent's dispatch.

use super::{id, Graph};
use crate::core::error::{Error, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError};
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const POLL: Duration = Duration::from_millis(25);

/// Cloneable cancellation flag. A child token is cancelled when it or any ancestor is.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    parent: Option<CancelToken>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that observes this one but can be cancelled independently.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(TokenInner {
                cancelled: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
            || self
                .inner
                .parent
                .as_ref()
                .is_some_and(CancelToken::is_cancelled)
    }

    /// `Err(Error::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled { running: vec![] })
        } else {
            Ok(())
        }
    }
}

/// Walk parameters.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Worker pool size.
    pub workers: usize,
    pub cancel: CancelToken,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            cancel: CancelToken::new(),
        }
    }
}

impl WalkOptions {
    pub fn with_workers(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
            ..Self::default()
        }
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Mutable view of one vertex during a transform.
///
/// Dependencies are read-only and already hold their post-transform
/// values; only the current vertex may be replaced, and new children may
/// be attached under it.
#[derive(Debug)]
pub struct Handle<V> {
    id: String,
    value: V,
    dependencies: BTreeMap<String, V>,
    children: Vec<(String, V)>,
    cancel: CancelToken,
}

impl<V> Handle<V> {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Replace the current vertex's value.
    pub fn set(&mut self, value: V) {
        self.value = value;
    }

    /// Post-transform values of the direct dependencies, keyed by ID.
    pub fn dependencies(&self) -> &BTreeMap<String, V> {
        &self.dependencies
    }

    pub fn dependency(&self, id: &str) -> Option<&V> {
        self.dependencies.get(id)
    }

    /// Attach a new child vertex `<current>/<segment>` with an edge from the current vertex.
    pub fn add_child(&mut self, segment: impl Into<String>, value: V) {
        self.children.push((id::join(&self.id, &segment.into()), value));
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}

impl<V: Clone + Send + Sync> Graph<V> {
    /// Visit every vertex after all of its dependencies, in parallel where possible.
    pub fn walk<F>(&self, opts: &WalkOptions, f: F) -> Result<()>
    where
        F: Fn(&str, &V, &CancelToken) -> Result<()> + Sync,
    {
        let mut state = ();
        self.schedule(
            opts,
            &mut state,
            |_, id| self.get(id),
            |id, value, cancel| match value {
                Some(value) => f(id, value, cancel),
                None => Err(Error::Internal(format!("vertex {} vanished", id))),
            },
            |_, _, _| {},
        )
    }

    /// Walk the graph, letting the callback replace each vertex's value.
    ///
    /// Returns the new graph; `self` is untouched. Children added through
    /// the handle are attached after the walk and are not themselves visited.
    pub fn transform<F>(&self, opts: &WalkOptions, f: F) -> Result<Graph<V>>
    where
        F: Fn(&mut Handle<V>) -> Result<()> + Sync,
    {
        struct TransformState<V> {
            graph: Graph<V>,
            added: Vec<(String, Vec<(String, V)>)>,
        }

        let mut state = TransformState {
            graph: self.clone(),
            added: Vec::new(),
        };

        self.schedule(
            opts,
            &mut state,
            |state, vertex_id| {
                let dependencies = state
                    .graph
                    .dependencies(vertex_id)
                    .into_iter()
                    .filter_map(|dep| state.graph.get(&dep).cloned().map(|v| (dep, v)))
                    .collect();
                (state.graph.get(vertex_id).cloned(), dependencies)
            },
            |vertex_id, (value, dependencies), cancel| {
                let value = value
                    .ok_or_else(|| Error::Internal(format!("vertex {} vanished", vertex_id)))?;
                let mut handle = Handle {
                    id: vertex_id.to_string(),
                    value,
                    dependencies,
                    children: Vec::new(),
                    cancel: cancel.clone(),
                };
                f(&mut handle)?;
                Ok((handle.value, handle.children))
            },
            |state, vertex_id, (value, children)| {
                state.graph.replace(vertex_id, value);
                if !children.is_empty() {
                    state.added.push((vertex_id.to_string(), children));
                }
            },
        )?;

        let TransformState { mut graph, added } = state;
        let grew = !added.is_empty();
        for (parent, children) in added {
            for (child, value) in children {
                graph.add(child.clone(), value)?;
                graph.connect(&parent, &child)?;
            }
        }
        if grew {
            graph.check_acyclic()?;
        }
        Ok(graph)
    }

    /// The scheduler loop shared by `walk` and `transform`.
    ///
    /// `prepare` and `complete` run on the scheduler thread with exclusive
    /// access to `state`; `job` runs on the pool.
    fn schedule<S, T, R, P, J, C>(
        &self,
        opts: &WalkOptions,
        state: &mut S,
        prepare: P,
        job: J,
        complete: C,
    ) -> Result<()>
    where
        T: Send,
        R: Send,
        P: Fn(&mut S, &str) -> T,
        J: Fn(&str, T, &CancelToken) -> Result<R> + Sync,
        C: Fn(&mut S, &str, R),
    {
        self.check_acyclic()?;
        if self.is_empty() {
            return Ok(());
        }

        let mut pending: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for vertex_id in self.ids() {
            pending.insert(vertex_id, 0);
        }
        for (from, to) in self.edges() {
            if let Some(count) = pending.get_mut(from) {
                *count += 1;
            }
            dependents.entry(to).or_default().push(from);
        }
        let mut ready: BTreeSet<&str> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(vertex_id, _)| *vertex_id)
            .collect();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.workers.max(1))
            .thread_name(|i| format!("walk-{}", i))
            .build()
            .map_err(|e| Error::Internal(format!("cannot start worker pool: {}", e)))?;

        let cancel = opts.cancel.child();
        let (sender, receiver) = unbounded::<(String, Result<R>)>();
        let total = self.len();
        let mut completed = 0usize;
        let mut running: BTreeSet<String> = BTreeSet::new();
        let mut failures: Vec<(String, Error)> = Vec::new();
        let mut interrupted: Option<Vec<String>> = None;
        let job = &job;

        pool.in_place_scope(|scope| {
            loop {
                if !cancel.is_cancelled() {
                    while let Some(vertex_id) = ready.pop_first() {
                        let input = prepare(state, vertex_id);
                        let sender = sender.clone();
                        let token = cancel.clone();
                        let owned_id = vertex_id.to_string();
                        running.insert(owned_id.clone());
                        debug!(vertex = %owned_id, "dispatch");
                        scope.spawn(move |_| {
                            let outcome = if token.is_cancelled() {
                                Err(Error::Cancelled { running: vec![] })
                            } else {
                                catch_unwind(AssertUnwindSafe(|| job(&owned_id, input, &token)))
                                    .unwrap_or_else(|payload| {
                                        Err(Error::Internal(format!(
                                            "panic in {}: {}",
                                            owned_id,
                                            panic_message(payload.as_ref())
                                        )))
                                    })
                            };
                            // The scheduler outlives every job, so the send cannot fail.
                            let _ = sender.send((owned_id, outcome));
                        });
                    }
                }

                if running.is_empty() {
                    break;
                }

                match receiver.recv_timeout(POLL) {
                    Ok((vertex_id, outcome)) => {
                        running.remove(&vertex_id);
                        completed += 1;
                        match outcome {
                            Ok(result) => {
                                debug!(vertex = %vertex_id, "complete");
                                complete(state, &vertex_id, result);
                                if let Some(next) = dependents.get(vertex_id.as_str()) {
                                    for dependent in next {
                                        if let Some(count) = pending.get_mut(dependent) {
                                            *count -= 1;
                                            if *count == 0 {
                                                ready.insert(dependent);
                                            }
                                        }
                                    }
                                }
                            }
                            Err(Error::Cancelled { .. }) if cancel.is_cancelled() => {}
                            Err(e) => {
                                warn!(vertex = %vertex_id, error = %e, "vertex failed, stopping walk");
                                failures.push((vertex_id, e));
                                cancel.cancel();
                            }
                        }
                    }
                    Err(RecvTimeoutError::Timeout) => {
                        if interrupted.is_none() && opts.cancel.is_cancelled() {
                            interrupted = Some(running.iter().cloned().collect());
                            cancel.cancel();
                        }
                    }
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });

        if opts.cancel.is_cancelled() {
            return Err(Error::Cancelled {
                running: interrupted.unwrap_or_default(),
            });
        }
        if !failures.is_empty() {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            return Err(Error::Walk(failures));
        }
        if completed != total {
            return Err(Error::Internal(format!(
                "walk finished {} of {} vertices",
                completed, total
            )));
        }
        Ok(())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
