use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use crate::cycle_check::find_cycle;
use crate::{BoxTask, GraphError};

pub use crate::cycle_check::Layers;

/// Immutable, validated dependency graph.
///
/// Validation happens once in [`Graph::build`]; a `Graph` value is always
/// acyclic and closed over its ids, so executing it never re-checks structure.
pub struct Graph {
    tasks: BTreeMap<String, BoxTask>,
    deps: BTreeMap<String, Vec<String>>,
    dependents: BTreeMap<String, Vec<String>>,
}

impl Graph {
    /// Build from the tasks' declared dependencies.
    pub fn new(tasks: impl IntoIterator<Item = BoxTask>) -> Result<Self, GraphError> {
        Self::build(tasks, std::iter::empty::<(String, String)>())
    }

    /// Build from tasks plus extra `(upstream, downstream)` edges.
    ///
    /// Edges are merged with what each task declares in `dependencies()`.
    pub fn build<E, S>(
        tasks: impl IntoIterator<Item = BoxTask>,
        edges: E,
    ) -> Result<Self, GraphError>
    where
        E: IntoIterator<Item = (S, S)>,
        S: Into<String>,
    {
        let mut by_id: BTreeMap<String, BoxTask> = BTreeMap::new();
        let mut deps: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();

        for task in tasks {
            let id = task.id().to_string();
            if by_id.contains_key(&id) {
                return Err(GraphError::DuplicateTask(id));
            }
            deps.insert(id.clone(), task.dependencies().into_iter().collect());
            by_id.insert(id, task);
        }

        for (upstream, downstream) in edges {
            let (upstream, downstream): (String, String) = (upstream.into(), downstream.into());
            match deps.get_mut(&downstream) {
                Some(set) => {
                    set.insert(upstream);
                }
                None => {
                    return Err(GraphError::UnknownTask {
                        task: upstream,
                        dependency: downstream,
                    });
                }
            }
        }

        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, ds) in &deps {
            for dep in ds {
                if dep == id {
                    return Err(GraphError::SelfDependency(id.clone()));
                }
                if !by_id.contains_key(dep) {
                    return Err(GraphError::UnknownTask {
                        task: id.clone(),
                        dependency: dep.clone(),
                    });
                }
                dependents.entry(dep.clone()).or_default().push(id.clone());
            }
        }

        let deps: BTreeMap<String, Vec<String>> = deps
            .into_iter()
            .map(|(id, ds)| (id, ds.into_iter().collect()))
            .collect();

        if let Some(tasks) = find_cycle(&deps, &dependents) {
            return Err(GraphError::Cycle { tasks });
        }

        Ok(Self {
            tasks: by_id,
            deps,
            dependents,
        })
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn task(&self, id: &str) -> Option<&BoxTask> {
        self.tasks.get(id)
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(String::as_str)
    }

    pub fn dependencies_of(&self, id: &str) -> &[String] {
        self.deps.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[String] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Lazily computed layers; every layer may run concurrently, layers run in order.
    pub fn topological_layers(&self) -> Layers<'_> {
        Layers::new(&self.deps, &self.dependents)
    }

    /// Tasks nothing depends on.
    pub fn terminal_tasks(&self) -> BTreeSet<&str> {
        self.task_ids()
            .filter(|id| self.dependents_of(id).is_empty())
            .collect()
    }

    /// Each root followed by its chain of dependents. A task reached again
    /// through another path is printed once more, marked `(*)`, without its
    /// subtree.
    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        let mut printed = BTreeSet::new();
        for root in self.task_ids().filter(|id| self.dependencies_of(id).is_empty()) {
            let _ = writeln!(out, "{root}");
            printed.insert(root);
            self.render_chain(&mut out, &mut printed, root, "  ");
        }
        out
    }

    fn render_chain<'a>(
        &'a self,
        out: &mut String,
        printed: &mut BTreeSet<&'a str>,
        id: &str,
        prefix: &str,
    ) {
        for child in self.dependents_of(id) {
            if !printed.insert(child.as_str()) {
                let _ = writeln!(out, "{prefix}└─> {child} (*)");
                continue;
            }
            let _ = writeln!(out, "{prefix}└─> {child}");
            self.render_chain(out, printed, child, &format!("{prefix}    "));
        }
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph").field("deps", &self.deps).finish()
    }
}
