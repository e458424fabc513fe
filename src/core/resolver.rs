use std::collections::BTreeMap;

use crate::core::component::{ComponentRepository, ModelComponent};
use crate::core::depgraph::{render_cycles, DependencyGraph};
use crate::core::logs::LogSink;
use crate::error::{Error, Result};

/// Defensive bound on the fixed-point iteration.
const MAX_LOOPS: usize = 1000;

/// Builds an ordered, acyclic plan of model components from a seed list,
/// honoring attribute `depends`/`provides`/`precedes` and component
/// `depends`/`precedes` declarations.
pub struct Resolver<'a> {
    repository: &'a ComponentRepository,
    attribute_defaults: &'a BTreeMap<String, String>,
    log: &'a LogSink,
}

/// A pending dependency: insert `name`, then order it before `parent`.
struct PendingDependency {
    name: String,
    parent: usize,
    grouping: i64,
}

impl<'a> Resolver<'a> {
    pub fn new(
        repository: &'a ComponentRepository,
        attribute_defaults: &'a BTreeMap<String, String>,
        log: &'a LogSink,
    ) -> Resolver<'a> {
        Resolver {
            repository,
            attribute_defaults,
            log,
        }
    }

    /// Resolve the seed list into an ordered plan.
    pub fn resolve(&self, seeds: &[String]) -> Result<Vec<ModelComponent>> {
        let mut graph = DependencyGraph::new();
        let mut instances: Vec<ModelComponent> = Vec::new();
        let mut pending: Vec<PendingDependency> = Vec::new();

        // Seed components enter at their seed-index grouping, duplicates
        // allowed, with explicit ordering between consecutive seeds.
        let mut previous: Option<usize> = None;
        for (grouping, seed) in seeds.iter().enumerate() {
            let component = self.lookup(seed)?;
            let handle = self.insert(
                &mut graph,
                &mut instances,
                component,
                grouping as i64,
                true,
            );
            let handle = handle.expect("duplicate inserts are always accepted");
            for dependency in instances[handle].component_depends().to_vec() {
                pending.push(PendingDependency {
                    name: dependency,
                    parent: handle,
                    grouping: grouping as i64,
                });
            }
            if let Some(previous) = previous {
                graph.associate(previous, handle);
            }
            previous = Some(handle);
        }

        let mut loops = 0usize;
        let mut changed = true;
        while changed {
            loops += 1;
            if loops > MAX_LOOPS {
                self.log.error("apparent infinite loop building the dependency graph");
                return Err(Error::InfiniteLoop);
            }
            changed = false;

            // Drain pending component dependencies to a fixed point.
            let mut inner_loops = 0usize;
            while !pending.is_empty() {
                inner_loops += 1;
                if inner_loops > MAX_LOOPS {
                    return Err(Error::InfiniteLoop);
                }
                changed = true;
                let mut next_pending = Vec::new();
                for request in pending.drain(..) {
                    let component = self.lookup(&request.name)?;
                    let inserted = self.insert(
                        &mut graph,
                        &mut instances,
                        component,
                        request.grouping,
                        false,
                    );
                    let dependency_handle = match inserted {
                        Some(handle) => {
                            for dependency in
                                instances[handle].component_depends().to_vec()
                            {
                                next_pending.push(PendingDependency {
                                    name: dependency,
                                    parent: handle,
                                    grouping: request.grouping,
                                });
                            }
                            handle
                        }
                        // Already present: reuse the first occurrence.
                        None => graph
                            .first_handle(&request.name)
                            .expect("rejected insert implies an existing instance"),
                    };
                    graph.associate(dependency_handle, request.parent);
                }
                pending = next_pending;
            }

            // Satisfy every in-degree-zero constraint with its default
            // provider.
            let unsatisfied = graph.in_degree_zero_constraints();
            if !unsatisfied.is_empty() {
                self.log.debug(&format!(
                    "have unsatisfied graph constraints: {unsatisfied:?}"
                ));
            }
            for (attribute, grouping) in unsatisfied {
                // An earlier default may have satisfied this one already.
                let still_unsatisfied = graph
                    .in_degree_zero_constraints()
                    .iter()
                    .any(|(name, _)| name == &attribute);
                if !still_unsatisfied {
                    continue;
                }
                changed = true;
                let component = self.default_component_for(&attribute)?;
                if let Some(handle) =
                    self.insert(&mut graph, &mut instances, &component, grouping, false)
                {
                    for dependency in instances[handle].component_depends().to_vec() {
                        pending.push(PendingDependency {
                            name: dependency,
                            parent: handle,
                            grouping,
                        });
                    }
                }
            }

            // Order `precedes` relations, inserting missing targets.
            changed |= self.order_precedes(&mut graph, &mut instances, &mut pending)?;

            if graph.has_cycles() {
                return self.cycle_error(&graph);
            }
        }

        let ordered = graph.ordered_entities()?;
        Ok(ordered
            .into_iter()
            .map(|(handle, _)| instances[handle].clone())
            .collect())
    }

    fn order_precedes(
        &self,
        graph: &mut DependencyGraph,
        instances: &mut Vec<ModelComponent>,
        pending: &mut Vec<PendingDependency>,
    ) -> Result<bool> {
        let mut changed = false;
        let ordered = match graph.ordered_entities() {
            Ok(ordered) => ordered,
            Err(Error::DependencyCycle { .. }) => return self.cycle_error(graph),
            Err(err) => return Err(err),
        };

        for (handle, grouping) in ordered {
            let component = instances[handle].clone();

            for target_name in component.component_precedes().to_vec() {
                changed |= self.order_one_precedes(
                    graph,
                    instances,
                    pending,
                    handle,
                    &target_name,
                    grouping,
                    None,
                )?;
            }

            for attribute in component.attribute_precedes().to_vec() {
                let target = self.default_component_for(&attribute)?;
                changed |= self.order_one_precedes(
                    graph,
                    instances,
                    pending,
                    handle,
                    &target.name.clone(),
                    grouping,
                    Some(target),
                )?;
            }
        }
        Ok(changed)
    }

    #[allow(clippy::too_many_arguments)]
    fn order_one_precedes(
        &self,
        graph: &mut DependencyGraph,
        instances: &mut Vec<ModelComponent>,
        pending: &mut Vec<PendingDependency>,
        source: usize,
        target_name: &str,
        grouping: i64,
        resolved_target: Option<ModelComponent>,
    ) -> Result<bool> {
        if graph.contains(target_name) {
            // The target exists: add an ordering edge only when the current
            // plan has it too early.
            let ordered = graph.ordered_entities()?;
            let source_name = &instances[source].name;
            let position = |name: &str| {
                ordered
                    .iter()
                    .position(|(handle, _)| instances[*handle].name == name)
            };
            let (Some(source_position), Some(target_position)) =
                (position(source_name), position(target_name))
            else {
                return Ok(false);
            };
            if source_position > target_position {
                let target_handle = graph
                    .first_handle(target_name)
                    .expect("contained name has an instance");
                graph.associate(source, target_handle);
            }
            return Ok(false);
        }

        // Insert the missing target, queue its dependencies, and queue the
        // source as a dependency of the target to order source before it.
        let component = match resolved_target {
            Some(component) => component,
            None => self.lookup(target_name)?.clone(),
        };
        let inserted = self.insert(graph, instances, &component, grouping, false);
        if let Some(target_handle) = inserted {
            for dependency in instances[target_handle].component_depends().to_vec() {
                pending.push(PendingDependency {
                    name: dependency,
                    parent: target_handle,
                    grouping,
                });
            }
            pending.push(PendingDependency {
                name: instances[source].name.clone(),
                parent: target_handle,
                grouping,
            });
        }
        Ok(true)
    }

    fn insert(
        &self,
        graph: &mut DependencyGraph,
        instances: &mut Vec<ModelComponent>,
        component: &ModelComponent,
        grouping: i64,
        duplicate: bool,
    ) -> Option<usize> {
        let handle = instances.len();
        let inserted = graph.insert(
            &component.name,
            handle,
            component.attribute_depends(),
            component.attribute_provides(),
            grouping,
            duplicate,
        );
        if inserted {
            instances.push(component.clone());
            Some(handle)
        } else {
            None
        }
    }

    fn lookup(&self, name: &str) -> Result<&ModelComponent> {
        self.repository.get(name).ok_or_else(|| Error::NotFound {
            store: "component repository".to_string(),
            name: name.to_string(),
        })
    }

    /// Pick the component that provides `attribute`: the unique installed
    /// provider, or the configured default when none or several exist.
    fn default_component_for(&self, attribute: &str) -> Result<ModelComponent> {
        let providers = self.repository.providers_of(attribute);
        if providers.len() == 1 {
            return Ok(providers[0].clone());
        }
        let multiple = providers.len() > 1;

        let Some(default_name) = self.attribute_defaults.get(attribute) else {
            if multiple {
                self.log.error(&format!(
                    "multiple providers and no default found for attribute \"{attribute}\""
                ));
                return Err(Error::NoDefaultProvider {
                    message: format!(
                        "Too many providers found for attribute '{attribute}'. \
                         Please specify a default."
                    ),
                });
            }
            self.log
                .error(&format!("no provider found for attribute \"{attribute}\""));
            return Err(Error::NoDefaultProvider {
                message: format!(
                    "No provider found for attribute '{attribute}'. \
                     Please install at least one."
                ),
            });
        };

        let Some(component) = self.repository.get(default_name) else {
            return Err(Error::InvalidDefaultProvider {
                message: format!(
                    "Default provider \"{default_name}\" for \"{attribute}\" was not found."
                ),
            });
        };
        if !component
            .attribute_provides()
            .iter()
            .any(|provided| provided == attribute)
        {
            return Err(Error::InvalidDefaultProvider {
                message: format!(
                    "Component '{}' does not provide '{attribute}'.",
                    component.name
                ),
            });
        }
        Ok(component.clone())
    }

    fn cycle_error<T>(&self, graph: &DependencyGraph) -> Result<T> {
        let cycles = graph.cycles();
        self.log.error(&format!(
            "unsatisfiable dependency graph contained {} cycle(s)",
            cycles.len()
        ));
        Err(Error::DependencyCycle {
            listing: render_cycles(&cycles),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::component::MANIFEST_FILE;
    use crate::core::logs::Level;

    struct Fixture {
        _dir: tempfile::TempDir,
        repository: ComponentRepository,
        log: LogSink,
    }

    fn fixture(manifests: &[(&str, &str)]) -> Fixture {
        let dir = tempfile::TempDir::new().expect("tempdir");
        for (name, body) in manifests {
            let path = dir.path().join(name);
            fs::create_dir_all(&path).expect("mkdir");
            fs::write(
                path.join(MANIFEST_FILE),
                format!("name = \"{name}\"\n{body}"),
            )
            .expect("manifest");
        }
        let repository =
            ComponentRepository::scan(&[dir.path().to_path_buf()]).expect("scan");
        let log = LogSink::open(
            "resolver-test",
            &dir.path().join("resolver.log"),
            Level::Debug,
        )
        .expect("log");
        Fixture {
            _dir: dir,
            repository,
            log,
        }
    }

    fn resolve(
        fixture: &Fixture,
        defaults: &[(&str, &str)],
        seeds: &[&str],
    ) -> Result<Vec<String>> {
        let defaults: BTreeMap<String, String> = defaults
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let resolver = Resolver::new(&fixture.repository, &defaults, &fixture.log);
        let seeds: Vec<String> = seeds.iter().map(|s| s.to_string()).collect();
        resolver
            .resolve(&seeds)
            .map(|plan| plan.into_iter().map(|mc| mc.name).collect())
    }

    #[test]
    fn two_component_plan_orders_provider_first() {
        let fixture = fixture(&[
            ("m1", "[attributes]\ndepends = [\"c1\"]\n"),
            ("m2", "[attributes]\nprovides = [\"c1\"]\n"),
        ]);
        let plan = resolve(&fixture, &[], &["m1"]).expect("resolve");
        assert_eq!(plan, vec!["m2", "m1"]);
    }

    #[test]
    fn ambiguous_attribute_uses_configured_default() {
        let fixture = fixture(&[
            ("m1", "[attributes]\ndepends = [\"c1\"]\n"),
            ("m_a", "[attributes]\nprovides = [\"c1\"]\n"),
            ("m_b", "[attributes]\nprovides = [\"c1\"]\n"),
        ]);
        let plan = resolve(&fixture, &[("c1", "m_b")], &["m1"]).expect("resolve");
        assert_eq!(plan, vec!["m_b", "m1"]);

        let err = resolve(&fixture, &[], &["m1"]).expect_err("no default");
        assert!(matches!(err, Error::NoDefaultProvider { .. }));
    }

    #[test]
    fn default_that_does_not_provide_is_invalid() {
        let fixture = fixture(&[
            ("m1", "[attributes]\ndepends = [\"c1\"]\n"),
            ("m_a", "[attributes]\nprovides = [\"c1\"]\n"),
            ("m_b", "[attributes]\nprovides = [\"c1\"]\n"),
            ("m_c", ""),
        ]);
        let err = resolve(&fixture, &[("c1", "m_c")], &["m1"]).expect_err("invalid");
        assert!(matches!(err, Error::InvalidDefaultProvider { .. }));
    }

    #[test]
    fn component_dependencies_recurse() {
        let fixture = fixture(&[
            ("top", "[model_components]\ndepends = [\"middle\"]\n"),
            ("middle", "[model_components]\ndepends = [\"bottom\"]\n"),
            ("bottom", ""),
        ]);
        let plan = resolve(&fixture, &[], &["top"]).expect("resolve");
        assert_eq!(plan, vec!["bottom", "middle", "top"]);
    }

    #[test]
    fn component_precedes_inserts_and_orders_target() {
        let fixture = fixture(&[
            ("setup", "[model_components]\nprecedes = [\"launch\"]\n"),
            ("launch", ""),
        ]);
        let plan = resolve(&fixture, &[], &["setup"]).expect("resolve");
        let setup = plan.iter().position(|n| n == "setup").expect("setup");
        let launch = plan.iter().position(|n| n == "launch").expect("launch");
        assert!(setup < launch);
    }

    #[test]
    fn attribute_precedes_orders_before_provider() {
        let fixture = fixture(&[
            ("early", "[attributes]\nprecedes = [\"finish\"]\n"),
            ("finisher", "[attributes]\nprovides = [\"finish\"]\n"),
        ]);
        let plan = resolve(&fixture, &[], &["early"]).expect("resolve");
        let early = plan.iter().position(|n| n == "early").expect("early");
        let finisher = plan.iter().position(|n| n == "finisher").expect("finisher");
        assert!(early < finisher);
    }

    #[test]
    fn dependency_cycles_are_fatal_with_listing() {
        let fixture = fixture(&[
            (
                "a",
                "[attributes]\ndepends = [\"c2\"]\nprovides = [\"c1\"]\n",
            ),
            (
                "b",
                "[attributes]\ndepends = [\"c1\"]\nprovides = [\"c2\"]\n",
            ),
        ]);
        let err = resolve(&fixture, &[], &["a", "b"]).expect_err("cycle");
        match err {
            Error::DependencyCycle { listing } => assert!(!listing.is_empty()),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn seed_order_is_preserved_between_independent_seeds() {
        let fixture = fixture(&[("s1", ""), ("s2", ""), ("s3", "")]);
        let plan = resolve(&fixture, &[], &["s2", "s1", "s3"]).expect("resolve");
        assert_eq!(plan, vec!["s2", "s1", "s3"]);
    }

    #[test]
    fn missing_seed_is_reported() {
        let fixture = fixture(&[("known", "")]);
        let err = resolve(&fixture, &[], &["ghost"]).expect_err("missing");
        assert!(matches!(err, Error::NotFound { .. }));
    }
}
