//! Definition-to-plan composition.
//!
//! Every stack group is flattened into one dependency DAG over resource
//! addresses (`group/id`). Edges come from explicit `depends_on`, from
//! attribute references (same group only) and from output references,
//! which make the consumer wait for every member of the producing group.
//!
//! Ordering is a depth-first post-order walk in declaration order, so the
//! plan is deterministic for a given definition. A back edge during the
//! walk is a cycle; its members are reported in cycle order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, warn};

use super::error::PlanError;
use super::group::StackGroup;
use super::plan::{DeployPlan, GroupPlan, PlanStep};
use super::resource::{address, ResourceKind};
use super::value::Reference;
use crate::custom_resource::SERVICE_TOKEN;
use crate::params::{ParameterStore, ResolvedParameters};

/// Collects stack groups and turns them into a [`DeployPlan`].
#[derive(Debug, Clone, Default)]
pub struct Composer {
    groups: Vec<StackGroup>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    Visiting,
    Done,
}

/// Depth-first topological order over `deps` (node -> dependencies).
/// Roots are visited in index order.
fn topo_order(labels: &[String], deps: &[Vec<usize>]) -> Result<Vec<usize>, PlanError> {
    fn visit(
        node: usize,
        labels: &[String],
        deps: &[Vec<usize>],
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
        order: &mut Vec<usize>,
    ) -> Result<(), PlanError> {
        match marks[node] {
            Mark::Done => return Ok(()),
            Mark::Visiting => {
                let start = stack.iter().position(|&n| n == node).unwrap_or(0);
                return Err(PlanError::CyclicDependency {
                    members: stack[start..].iter().map(|&n| labels[n].clone()).collect(),
                });
            }
            Mark::Unvisited => {}
        }
        marks[node] = Mark::Visiting;
        stack.push(node);
        for &dep in &deps[node] {
            visit(dep, labels, deps, marks, stack, order)?;
        }
        stack.pop();
        marks[node] = Mark::Done;
        order.push(node);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; labels.len()];
    let mut stack = Vec::new();
    let mut order = Vec::with_capacity(labels.len());
    for node in 0..labels.len() {
        visit(node, labels, deps, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}

fn push_unique(deps: &mut Vec<usize>, node: usize) {
    if !deps.contains(&node) {
        deps.push(node);
    }
}

impl Composer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_group(&mut self, group: StackGroup) -> Result<(), PlanError> {
        if self.group(&group.id).is_some() {
            return Err(PlanError::DuplicateGroup { group: group.id });
        }
        self.groups.push(group);
        Ok(())
    }

    pub fn group(&self, id: &str) -> Option<&StackGroup> {
        self.groups.iter().find(|g| g.id == id)
    }

    pub fn group_mut(&mut self, id: &str) -> Option<&mut StackGroup> {
        self.groups.iter_mut().find(|g| g.id == id)
    }

    pub fn groups(&self) -> &[StackGroup] {
        &self.groups
    }

    /// Every parameter declared across all groups, with overrides applied.
    pub fn parameter_store(
        &self,
        overrides: &BTreeMap<String, String>,
    ) -> Result<ParameterStore, PlanError> {
        let mut store = ParameterStore::new();
        for parameter in self.groups.iter().flat_map(|g| g.parameters()) {
            store.declare(parameter.clone())?;
        }
        for (name, value) in overrides {
            store.set_override(name.clone(), value.clone());
        }
        Ok(store)
    }

    /// Validate the definition and produce an ordered plan.
    pub fn plan(&self, overrides: &BTreeMap<String, String>) -> Result<DeployPlan, PlanError> {
        self.check_nesting()?;
        let params = self.parameter_store(overrides)?.resolve()?;
        let consumes = self.output_edges(&params)?;

        let mut labels = Vec::new();
        let mut owners = Vec::new();
        for group in &self.groups {
            for resource in group.resources() {
                labels.push(address(&group.id, &resource.id));
                owners.push((group, resource));
            }
        }
        let index: HashMap<&str, usize> = labels
            .iter()
            .enumerate()
            .map(|(i, a)| (a.as_str(), i))
            .collect();

        let mut deps: Vec<Vec<usize>> = Vec::with_capacity(labels.len());
        for (i, (group, resource)) in owners.iter().enumerate() {
            let origin = &labels[i];
            let mut node_deps = Vec::new();

            for id in &resource.depends_on {
                let target = self.local_target(group, id, origin)?;
                push_unique(&mut node_deps, index[target.as_str()]);
            }

            let is_custom = resource.kind == ResourceKind::CustomResource;
            if is_custom && !resource.properties.contains_key(SERVICE_TOKEN) {
                return Err(PlanError::InvalidValue {
                    resource: origin.clone(),
                    reason: format!("custom resource has no {SERVICE_TOKEN} property"),
                });
            }

            for (key, value) in &resource.properties {
                if is_custom && !value.is_scalar_shaped() {
                    return Err(PlanError::NonScalarProperty {
                        resource: origin.clone(),
                        property: key.clone(),
                    });
                }
                for reference in value.references() {
                    match reference {
                        Reference::Parameter(name) => {
                            if !params.contains(name) {
                                return Err(PlanError::UnknownParameter {
                                    resource: origin.clone(),
                                    name: name.to_string(),
                                });
                            }
                        }
                        Reference::Attribute { resource_id, .. } => {
                            let target = self.local_target(group, resource_id, origin)?;
                            push_unique(&mut node_deps, index[target.as_str()]);
                        }
                        Reference::Output { group: producer, name } => {
                            let producer = self.output_target(group, producer, name, origin)?;
                            for settled in self.publish_closure(&producer.id, &consumes) {
                                if let Some(g) = self.group(&settled) {
                                    for member in g.resources() {
                                        let member = address(&g.id, &member.id);
                                        push_unique(&mut node_deps, index[member.as_str()]);
                                    }
                                }
                            }
                        }
                    }
                }
            }
            deps.push(node_deps);
        }

        let order = topo_order(&labels, &deps)?;

        let mut levels = vec![0usize; labels.len()];
        let mut steps = Vec::with_capacity(order.len());
        for (position, &node) in order.iter().enumerate() {
            let level = deps[node]
                .iter()
                .map(|&d| levels[d] + 1)
                .max()
                .unwrap_or(0);
            levels[node] = level;
            let (group, resource) = owners[node];
            steps.push(PlanStep {
                position,
                address: labels[node].clone(),
                group: group.id.clone(),
                resource: resource.clone(),
                depends_on: deps[node].iter().map(|&d| labels[d].clone()).collect(),
                level,
            });
        }

        let groups = self
            .groups
            .iter()
            .map(|g| GroupPlan {
                id: g.id.clone(),
                parent: g.parent.clone(),
                members: g.resources().iter().map(|r| address(&g.id, &r.id)).collect(),
                outputs: g.outputs().clone(),
                consumes: consumes.get(&g.id).cloned().unwrap_or_default(),
            })
            .collect();

        let warnings: Vec<_> = self.groups.iter().flat_map(StackGroup::lint).collect();
        for warning in &warnings {
            warn!(role = %warning.role, statement = %warning.statement, "{}", warning.message);
        }

        debug!(
            steps = steps.len(),
            groups = self.groups.len(),
            params = params.len(),
            "deploy plan composed"
        );
        Ok(DeployPlan::new(params, steps, groups, warnings))
    }

    /// Parents must exist and nesting must not loop.
    fn check_nesting(&self) -> Result<(), PlanError> {
        for group in &self.groups {
            let mut seen = BTreeSet::from([group.id.as_str()]);
            let mut current = group;
            while let Some(parent_id) = &current.parent {
                let parent = self.group(parent_id).ok_or_else(|| PlanError::UnknownParent {
                    group: current.id.clone(),
                    parent: parent_id.clone(),
                })?;
                if !seen.insert(parent.id.as_str()) {
                    return Err(PlanError::NestingCycle {
                        group: group.id.clone(),
                    });
                }
                current = parent;
            }
        }
        Ok(())
    }

    /// Resolve a same-group resource id to its address.
    fn local_target(&self, group: &StackGroup, id: &str, origin: &str) -> Result<String, PlanError> {
        if group.resource(id).is_some() {
            return Ok(address(&group.id, id));
        }
        match self.groups.iter().find(|g| g.resource(id).is_some()) {
            Some(owner) => Err(PlanError::OwnershipViolation {
                resource: origin.to_string(),
                target: address(&owner.id, id),
                owner: owner.id.clone(),
            }),
            None => Err(PlanError::DanglingReference {
                resource: origin.to_string(),
                target: address(&group.id, id),
            }),
        }
    }

    fn output_target(
        &self,
        consumer: &StackGroup,
        producer: &str,
        name: &str,
        origin: &str,
    ) -> Result<&StackGroup, PlanError> {
        if producer == consumer.id {
            return Err(PlanError::InvalidValue {
                resource: origin.to_string(),
                reason: format!(
                    "group '{producer}' cannot consume its own output '{name}'; \
                     reference the attribute directly"
                ),
            });
        }
        self.group(producer)
            .filter(|g| g.outputs().contains_key(name))
            .ok_or_else(|| PlanError::DanglingReference {
                resource: origin.to_string(),
                target: format!("{producer}.{name}"),
            })
    }

    /// Validate output values and return, per group, the groups whose
    /// outputs its own outputs consume.
    fn output_edges(
        &self,
        params: &ResolvedParameters,
    ) -> Result<BTreeMap<String, BTreeSet<String>>, PlanError> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for group in &self.groups {
            let consumed = edges.entry(group.id.clone()).or_default();
            for (name, value) in group.outputs() {
                let origin = format!("{}.{name}", group.id);
                for reference in value.references() {
                    match reference {
                        Reference::Parameter(p) if !params.contains(p) => {
                            return Err(PlanError::UnknownParameter {
                                resource: origin,
                                name: p.to_string(),
                            });
                        }
                        Reference::Parameter(_) => {}
                        Reference::Attribute { resource_id, .. } => {
                            self.local_target(group, resource_id, &origin)?;
                        }
                        Reference::Output { group: producer, name } => {
                            let producer = self.output_target(group, producer, name, &origin)?;
                            consumed.insert(producer.id.clone());
                        }
                    }
                }
            }
        }

        let labels: Vec<String> = self.groups.iter().map(|g| g.id.clone()).collect();
        let deps: Vec<Vec<usize>> = self
            .groups
            .iter()
            .map(|g| {
                edges[&g.id]
                    .iter()
                    .filter_map(|p| labels.iter().position(|l| l == p))
                    .collect()
            })
            .collect();
        topo_order(&labels, &deps)?;
        Ok(edges)
    }

    /// `group` plus every group its outputs transitively consume.
    fn publish_closure(
        &self,
        group: &str,
        consumes: &BTreeMap<String, BTreeSet<String>>,
    ) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack = vec![group.to_string()];
        while let Some(current) = stack.pop() {
            if seen.insert(current.clone()) {
                if let Some(next) = consumes.get(&current) {
                    stack.extend(next.iter().cloned());
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_resource::custom_resource;
    use crate::graph::{LogicalResource, Value};
    use crate::params::Parameter;

    fn res(id: &str) -> LogicalResource {
        LogicalResource::new(id, ResourceKind::Generic("test.node".into()))
    }

    fn plan(composer: &Composer) -> Result<DeployPlan, PlanError> {
        composer.plan(&BTreeMap::new())
    }

    #[test]
    fn dependencies_come_first_and_declaration_order_breaks_ties() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("c").depends_on("a")).unwrap();
        g.add_resource(res("b")).unwrap();
        g.add_resource(res("a")).unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();

        let plan = plan(&composer).unwrap();
        assert_eq!(plan.order(), vec!["g/a", "g/c", "g/b"]);
        assert_eq!(plan.step("g/c").unwrap().level, 1);
        assert_eq!(plan.step("g/b").unwrap().level, 0);
    }

    #[test]
    fn attribute_reference_creates_edge() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("consumer").with_property("Endpoint", Value::attr("domain", "DomainEndpoint")))
            .unwrap();
        g.add_resource(res("domain")).unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();

        let plan = plan(&composer).unwrap();
        assert_eq!(plan.order(), vec!["g/domain", "g/consumer"]);
        assert_eq!(plan.step("g/consumer").unwrap().depends_on, vec!["g/domain"]);
    }

    #[test]
    fn output_reference_waits_for_whole_group() {
        let mut search = StackGroup::new("search");
        search.add_resource(res("domain")).unwrap();
        search.add_resource(res("pool")).unwrap();
        search.add_output("DomainEndpoint", Value::attr("domain", "DomainEndpoint"));

        let mut pipeline = StackGroup::new("pipeline");
        pipeline
            .add_resource(res("stream").with_property("Endpoint", Value::output("search", "DomainEndpoint")))
            .unwrap();

        let mut composer = Composer::new();
        composer.add_group(pipeline).unwrap();
        composer.add_group(search).unwrap();

        let plan = plan(&composer).unwrap();
        assert_eq!(
            plan.step("pipeline/stream").unwrap().depends_on,
            vec!["search/domain", "search/pool"]
        );
        assert_eq!(plan.order().last(), Some(&"pipeline/stream"));
    }

    #[test]
    fn cycle_reports_members() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("a").depends_on("b")).unwrap();
        g.add_resource(res("b").with_property("X", Value::attr("a", "Arn")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();

        match plan(&composer).unwrap_err() {
            PlanError::CyclicDependency { members } => {
                assert_eq!(members, vec!["g/a".to_string(), "g/b".to_string()]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("a").with_property("X", Value::attr("a", "Arn")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();
        assert!(matches!(
            plan(&composer),
            Err(PlanError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn cross_group_attribute_is_ownership_violation() {
        let mut search = StackGroup::new("search");
        search.add_resource(res("domain")).unwrap();
        let mut app = StackGroup::new("app");
        app.add_resource(res("fn").with_property("Host", Value::attr("domain", "DomainEndpoint")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(search).unwrap();
        composer.add_group(app).unwrap();

        assert_eq!(
            plan(&composer).unwrap_err(),
            PlanError::OwnershipViolation {
                resource: "app/fn".into(),
                target: "search/domain".into(),
                owner: "search".into(),
            }
        );
    }

    #[test]
    fn missing_attribute_target_is_dangling() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("fn").with_property("Host", Value::attr("ghost", "Arn")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();
        assert!(matches!(
            plan(&composer),
            Err(PlanError::DanglingReference { .. })
        ));
    }

    #[test]
    fn unknown_output_is_dangling() {
        let mut a = StackGroup::new("a");
        a.add_resource(res("x").with_property("V", Value::output("b", "Missing")))
            .unwrap();
        let b = StackGroup::new("b");
        let mut composer = Composer::new();
        composer.add_group(a).unwrap();
        composer.add_group(b).unwrap();
        assert_eq!(
            plan(&composer).unwrap_err(),
            PlanError::DanglingReference {
                resource: "a/x".into(),
                target: "b.Missing".into()
            }
        );
    }

    #[test]
    fn unknown_parameter_rejected() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("x").with_property("Size", Value::param("volumeSize")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();
        assert!(matches!(
            plan(&composer),
            Err(PlanError::UnknownParameter { .. })
        ));
    }

    #[test]
    fn declared_parameter_accepted_and_overridable() {
        let mut g = StackGroup::new("g");
        g.add_parameter(Parameter::number("volumeSize", 10.0, "size"));
        g.add_resource(res("x").with_property("Size", Value::param("volumeSize")))
            .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();

        let overrides = BTreeMap::from([("volumeSize".to_string(), "20".to_string())]);
        let plan = composer.plan(&overrides).unwrap();
        assert_eq!(
            plan.params.get("volumeSize"),
            Some(&crate::graph::Scalar::Number(20.0))
        );
    }

    #[test]
    fn custom_resource_properties_must_be_scalar() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("handler")).unwrap();
        g.add_resource(
            custom_resource("customizer", Value::attr("handler", "Arn"))
                .with_property("Hosts", Value::list([Value::lit("a")])),
        )
        .unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();
        assert_eq!(
            plan(&composer).unwrap_err(),
            PlanError::NonScalarProperty {
                resource: "g/customizer".into(),
                property: "Hosts".into()
            }
        );
    }

    #[test]
    fn unknown_parent_and_nesting_cycles_rejected() {
        let mut composer = Composer::new();
        composer
            .add_group(StackGroup::new("child").nested_under("ghost"))
            .unwrap();
        assert!(matches!(
            plan(&composer),
            Err(PlanError::UnknownParent { .. })
        ));

        let mut composer = Composer::new();
        composer.add_group(StackGroup::new("a").nested_under("b")).unwrap();
        composer.add_group(StackGroup::new("b").nested_under("a")).unwrap();
        assert!(matches!(
            plan(&composer),
            Err(PlanError::NestingCycle { .. })
        ));
    }

    #[test]
    fn duplicate_group_rejected() {
        let mut composer = Composer::new();
        composer.add_group(StackGroup::new("a")).unwrap();
        assert!(composer.add_group(StackGroup::new("a")).is_err());
    }

    #[test]
    fn levels_partition_independent_steps() {
        let mut g = StackGroup::new("g");
        g.add_resource(res("a")).unwrap();
        g.add_resource(res("b")).unwrap();
        g.add_resource(res("c").depends_on("a").depends_on("b")).unwrap();
        let mut composer = Composer::new();
        composer.add_group(g).unwrap();

        let plan = plan(&composer).unwrap();
        let levels = plan.levels();
        assert_eq!(levels.len(), 2);
        assert_eq!(levels[0].len(), 2);
        assert_eq!(levels[1][0].address, "g/c");
        assert_eq!(
            plan.transitive_dependents("g/a"),
            BTreeSet::from(["g/c".to_string()])
        );
    }
}
