use std::collections::{BTreeMap, BTreeSet};

/// Kahn's algorithm, one layer per step.
///
/// Layer *k* holds exactly the tasks whose dependencies all sit in layers `< k`.
/// Tasks on a cycle never reach in-degree zero and are left behind in
/// `in_degree` once the iterator is exhausted.
#[derive(Debug, Clone)]
pub struct Layers<'a> {
    dependents: &'a BTreeMap<String, Vec<String>>,
    in_degree: BTreeMap<&'a str, usize>,
    frontier: BTreeSet<&'a str>,
}

impl<'a> Layers<'a> {
    pub(crate) fn new(
        deps: &'a BTreeMap<String, Vec<String>>,
        dependents: &'a BTreeMap<String, Vec<String>>,
    ) -> Self {
        let in_degree: BTreeMap<&str, usize> = deps
            .iter()
            .map(|(id, d)| (id.as_str(), d.len()))
            .collect();
        let frontier = in_degree
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(id, _)| *id)
            .collect();

        Self {
            dependents,
            in_degree,
            frontier,
        }
    }
}

impl<'a> Iterator for Layers<'a> {
    type Item = BTreeSet<&'a str>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.frontier.is_empty() {
            return None;
        }

        let layer = std::mem::take(&mut self.frontier);
        let dependents = self.dependents;
        for id in &layer {
            self.in_degree.remove(id);
            for child in dependents.get(*id).into_iter().flatten() {
                if let Some(degree) = self.in_degree.get_mut(child.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        self.frontier.insert(child.as_str());
                    }
                }
            }
        }

        Some(layer)
    }
}

/// Returns the ids that sit on a cycle, or `None` if the relation is acyclic.
///
/// Kahn's remainder also holds tasks that are only downstream of a cycle, or
/// that bridge two cycles; a remaining task is reported only if it can reach
/// itself through other remaining tasks.
pub fn find_cycle(
    deps: &BTreeMap<String, Vec<String>>,
    dependents: &BTreeMap<String, Vec<String>>,
) -> Option<Vec<String>> {
    let mut layers = Layers::new(deps, dependents);
    for _ in layers.by_ref() {}

    let stuck: BTreeSet<&str> = layers.in_degree.keys().copied().collect();
    if stuck.is_empty() {
        return None;
    }

    let on_cycle: Vec<String> = stuck
        .iter()
        .filter(|id| reaches(id, id, &stuck, dependents))
        .map(|id| id.to_string())
        .collect();
    Some(on_cycle)
}

/// Whether `to` is reachable from `from` by at least one edge inside `within`.
fn reaches(
    from: &str,
    to: &str,
    within: &BTreeSet<&str>,
    dependents: &BTreeMap<String, Vec<String>>,
) -> bool {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let mut stack = vec![from];
    while let Some(id) = stack.pop() {
        for child in dependents.get(id).into_iter().flatten() {
            let child = child.as_str();
            if child == to {
                return true;
            }
            if within.contains(child) && seen.insert(child) {
                stack.push(child);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(edges: &[(&str, Vec<&str>)]) -> (BTreeMap<String, Vec<String>>, BTreeMap<String, Vec<String>>) {
        let mut deps = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (id, ds) in edges {
            deps.insert(id.to_string(), ds.iter().map(|d| d.to_string()).collect());
            for d in ds {
                dependents.entry(d.to_string()).or_default().push(id.to_string());
            }
        }
        (deps, dependents)
    }

    #[test]
    fn diamond_layers() {
        let (deps, dependents) = relation(&[
            ("a", vec![]),
            ("b", vec!["a"]),
            ("c", vec!["a"]),
            ("d", vec!["b", "c"]),
        ]);
        let layers: Vec<Vec<&str>> = Layers::new(&deps, &dependents)
            .map(|l| l.into_iter().collect())
            .collect();
        assert_eq!(layers, vec![vec!["a"], vec!["b", "c"], vec!["d"]]);
        assert_eq!(find_cycle(&deps, &dependents), None);
    }

    #[test]
    fn reports_only_cycle_members() {
        let (deps, dependents) = relation(&[
            ("root", vec![]),
            ("a", vec!["root", "b"]),
            ("b", vec!["a"]),
            ("downstream", vec!["b"]),
        ]);
        assert_eq!(
            find_cycle(&deps, &dependents),
            Some(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn bridge_between_cycles_is_not_a_member() {
        let (deps, dependents) = relation(&[
            ("a", vec!["b"]),
            ("b", vec!["a"]),
            ("x", vec!["b"]),
            ("c", vec!["d", "x"]),
            ("d", vec!["c"]),
        ]);
        let members = ["a", "b", "c", "d"].map(String::from).to_vec();
        assert_eq!(find_cycle(&deps, &dependents), Some(members));
    }
}
