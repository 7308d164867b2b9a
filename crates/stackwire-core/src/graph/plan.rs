use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use super::resource::LogicalResource;
use super::value::Value;
use crate::params::ResolvedParameters;
use crate::policy::LintWarning;

/// One resource in topological position.
#[derive(Debug, Clone)]
pub struct PlanStep {
    /// Index in the deploy order
    pub position: usize,
    pub address: String,
    pub group: String,
    pub resource: LogicalResource,
    /// Addresses that must settle first
    pub depends_on: Vec<String>,
    /// 0 for roots, otherwise one more than the deepest dependency
    pub level: usize,
}

/// Per-group view of the plan.
#[derive(Debug, Clone)]
pub struct GroupPlan {
    pub id: String,
    pub parent: Option<String>,
    /// Member addresses in declaration order
    pub members: Vec<String>,
    pub outputs: BTreeMap<String, Value>,
    /// Groups whose outputs this group's outputs consume; they must publish
    /// before this group can
    pub consumes: BTreeSet<String>,
}

/// A validated, ordered deploy plan.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub params: ResolvedParameters,
    pub steps: Vec<PlanStep>,
    pub groups: Vec<GroupPlan>,
    pub warnings: Vec<LintWarning>,
    index: HashMap<String, usize>,
    dependents: HashMap<String, Vec<String>>,
}

impl DeployPlan {
    pub(crate) fn new(
        params: ResolvedParameters,
        steps: Vec<PlanStep>,
        groups: Vec<GroupPlan>,
        warnings: Vec<LintWarning>,
    ) -> Self {
        let index = steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.address.clone(), i))
            .collect();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        for step in &steps {
            for dep in &step.depends_on {
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .push(step.address.clone());
            }
        }
        Self {
            params,
            steps,
            groups,
            warnings,
            index,
            dependents,
        }
    }

    /// Addresses in deploy order.
    pub fn order(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.address.as_str()).collect()
    }

    pub fn step(&self, address: &str) -> Option<&PlanStep> {
        self.index.get(address).map(|&i| &self.steps[i])
    }

    pub fn contains(&self, address: &str) -> bool {
        self.index.contains_key(address)
    }

    pub fn group(&self, id: &str) -> Option<&GroupPlan> {
        self.groups.iter().find(|g| g.id == id)
    }

    /// Steps grouped by level. Steps within a level have no edges between
    /// them and may be applied concurrently.
    pub fn levels(&self) -> Vec<Vec<&PlanStep>> {
        let depth = self.steps.iter().map(|s| s.level + 1).max().unwrap_or(0);
        let mut levels: Vec<Vec<&PlanStep>> = vec![Vec::new(); depth];
        for step in &self.steps {
            levels[step.level].push(step);
        }
        levels
    }

    /// Direct dependents of `address`.
    pub fn dependents_of(&self, address: &str) -> &[String] {
        self.dependents
            .get(address)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every address that directly or indirectly depends on `address`.
    pub fn transitive_dependents(&self, address: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([address]);
        while let Some(current) = queue.pop_front() {
            for dependent in self.dependents_of(current) {
                if seen.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }
        seen
    }
}
