use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::core::component::ModelComponent;
use crate::core::graph::{CapabilityRegistry, ExperimentGraph};
use crate::core::logs::LogSink;
use crate::core::store::FileStore;
use crate::error::{Error, Result};

/// Arguments passed to a plugin's `run`, split the way manifests declare
/// them: a positional list under the empty key plus keyword arguments.
#[derive(Debug, Clone, Default)]
pub struct PluginArgs {
    pub positional: Vec<toml::Value>,
    pub keyword: BTreeMap<String, toml::Value>,
}

impl PluginArgs {
    /// Extract the `arguments.plugin` table from a manifest.
    pub fn from_component(component: &ModelComponent) -> PluginArgs {
        let mut args = PluginArgs::default();
        let Some(toml::Value::Table(table)) = component.manifest.arguments.get("plugin")
        else {
            return args;
        };
        for (key, value) in table {
            if key.is_empty() {
                match value {
                    toml::Value::Array(values) => args.positional = values.clone(),
                    other => args.positional = vec![other.clone()],
                }
            } else {
                args.keyword.insert(key.clone(), value.clone());
            }
        }
        args
    }
}

/// A model component's plugin: receives the experiment graph and mutates it
/// through the graph's defined operations.
pub trait Plugin: Send {
    fn run(&mut self, graph: &mut ExperimentGraph, args: &PluginArgs) -> Result<()>;
}

pub type PluginFactory = fn() -> Box<dyn Plugin>;

/// Link-time registry of plugins, keyed by the name manifests reference.
#[derive(Default)]
pub struct PluginRegistry {
    factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
    pub fn new() -> PluginRegistry {
        PluginRegistry::default()
    }

    pub fn register(&mut self, name: &str, factory: PluginFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn get(&self, name: &str) -> Option<&PluginFactory> {
        self.factories.get(name)
    }
}

/// Outcome of processing one model component.
#[derive(Debug, Clone)]
pub struct ComponentRunReport {
    pub model_component: String,
    pub errors: bool,
    pub seconds: f64,
}

/// Runs each component's plugin in resolver order against the experiment
/// graph, then uploads the component's artifacts.
pub struct PluginHost<'a> {
    plugins: &'a PluginRegistry,
    capabilities: &'a CapabilityRegistry,
    log: &'a LogSink,
    /// Plugins are instantiated exactly once per name.
    instantiated: BTreeMap<String, Box<dyn Plugin>>,
    imported_objects: BTreeSet<String>,
}

impl<'a> PluginHost<'a> {
    pub fn new(
        plugins: &'a PluginRegistry,
        capabilities: &'a CapabilityRegistry,
        log: &'a LogSink,
    ) -> PluginHost<'a> {
        PluginHost {
            plugins,
            capabilities,
            log,
            instantiated: BTreeMap::new(),
            imported_objects: BTreeSet::new(),
        }
    }

    /// Process the whole ordered plan, building the experiment graph.
    pub fn run_components(
        &mut self,
        plan: &[ModelComponent],
        graph: &mut ExperimentGraph,
        stores: Option<(&FileStore, &FileStore)>,
        dry_run: bool,
    ) -> Result<Vec<ComponentRunReport>> {
        let mut reports = Vec::new();
        for component in plan {
            self.log
                .debug(&format!("processing model component {}", component.name));
            let start = Instant::now();
            let errors = self.process_component(component, graph, stores, dry_run)?;
            reports.push(ComponentRunReport {
                model_component: component.name.clone(),
                errors,
                seconds: start.elapsed().as_secs_f64(),
            });
        }
        Ok(reports)
    }

    fn process_component(
        &mut self,
        component: &ModelComponent,
        graph: &mut ExperimentGraph,
        stores: Option<(&FileStore, &FileStore)>,
        dry_run: bool,
    ) -> Result<bool> {
        let mut errors = false;

        // A component's object group must resolve against the capability
        // registry before its plugin (or any later plugin) may decorate
        // with it.
        if let Some(objects) = &component.manifest.model_component_objects {
            if self.imported_objects.contains(objects) {
                return Err(Error::ModelComponentImport {
                    component: component.name.clone(),
                    detail: vec![format!(
                        "capability group `{objects}` has already been imported"
                    )],
                });
            }
            if !self.capabilities.contains(objects) {
                return Err(Error::ModelComponentImport {
                    component: component.name.clone(),
                    detail: vec![
                        format!("capability group `{objects}` is not registered"),
                        "model component objects must be registered at link time"
                            .to_string(),
                        format!("referenced from {}", component.path.display()),
                    ],
                });
            }
            self.imported_objects.insert(objects.clone());
        }

        if let Some(plugin_name) = component.manifest.plugin.clone() {
            if !self.instantiated.contains_key(&plugin_name) {
                let Some(factory) = self.plugins.get(&plugin_name) else {
                    return Err(Error::ModelComponentImport {
                        component: component.name.clone(),
                        detail: vec![
                            format!("plugin `{plugin_name}` is not registered"),
                            "plugins must be registered at link time".to_string(),
                            format!("referenced from {}", component.path.display()),
                        ],
                    });
                };
                self.instantiated.insert(plugin_name.clone(), factory());
            }
            if !dry_run {
                let args = PluginArgs::from_component(component);
                let plugin = self
                    .instantiated
                    .get_mut(&plugin_name)
                    .expect("instantiated above");
                plugin.run(graph, &args)?;
            }
        }

        if !dry_run {
            if let Some((vm_resources, images)) = stores {
                let upload_errors =
                    component.upload_files(vm_resources, images, self.log)?;
                errors = upload_errors > 0;
            }
        }

        Ok(errors)
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::core::component::{ComponentRepository, MANIFEST_FILE};
    use crate::core::logs::Level;

    struct AddVmPlugin;

    impl Plugin for AddVmPlugin {
        fn run(&mut self, graph: &mut ExperimentGraph, args: &PluginArgs) -> Result<()> {
            let count = args
                .keyword
                .get("count")
                .and_then(toml::Value::as_integer)
                .unwrap_or(1);
            for index in 0..count {
                let vertex = graph.add_vertex(Some(&format!("vm-{index}")));
                graph
                    .vertex_mut(vertex)
                    .expect("fresh vertex")
                    .set("vm", json!({"name": format!("vm-{index}")}));
            }
            Ok(())
        }
    }

    fn write_component(root: &PathBuf, name: &str, body: &str) {
        let path = root.join(name);
        fs::create_dir_all(&path).expect("mkdir");
        fs::write(
            path.join(MANIFEST_FILE),
            format!("name = \"{name}\"\n{body}"),
        )
        .expect("manifest");
    }

    fn log(dir: &tempfile::TempDir) -> LogSink {
        LogSink::open("plugin-test", &dir.path().join("test.log"), Level::Debug).expect("log")
    }

    #[test]
    fn plugins_run_in_order_with_arguments() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        write_component(
            &root,
            "topology",
            "plugin = \"add_vms\"\n[arguments.plugin]\ncount = 3\n",
        );
        let repository = ComponentRepository::scan(&[root]).expect("scan");
        let plan = vec![repository.get("topology").expect("component").clone()];

        let mut plugins = PluginRegistry::new();
        plugins.register("add_vms", || Box::new(AddVmPlugin));
        let capabilities = CapabilityRegistry::new();
        let log = log(&dir);
        let mut host = PluginHost::new(&plugins, &capabilities, &log);

        let mut graph = ExperimentGraph::new();
        let reports = host
            .run_components(&plan, &mut graph, None, false)
            .expect("run");
        assert_eq!(reports.len(), 1);
        assert!(!reports[0].errors);
        assert_eq!(graph.vertices().len(), 3);
    }

    #[test]
    fn missing_plugin_registration_is_an_import_error() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        write_component(&root, "broken", "plugin = \"nonexistent\"\n");
        let repository = ComponentRepository::scan(&[root]).expect("scan");
        let plan = vec![repository.get("broken").expect("component").clone()];

        let plugins = PluginRegistry::new();
        let capabilities = CapabilityRegistry::new();
        let log = log(&dir);
        let mut host = PluginHost::new(&plugins, &capabilities, &log);

        let mut graph = ExperimentGraph::new();
        let err = host
            .run_components(&plan, &mut graph, None, false)
            .expect_err("import error");
        match err {
            Error::ModelComponentImport { component, detail } => {
                assert_eq!(component, "broken");
                assert!(detail.len() <= 3);
                assert!(detail[0].contains("nonexistent"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn dry_run_checks_imports_without_running() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        write_component(&root, "topology", "plugin = \"add_vms\"\n");
        let repository = ComponentRepository::scan(&[root]).expect("scan");
        let plan = vec![repository.get("topology").expect("component").clone()];

        let mut plugins = PluginRegistry::new();
        plugins.register("add_vms", || Box::new(AddVmPlugin));
        let capabilities = CapabilityRegistry::new();
        let log = log(&dir);
        let mut host = PluginHost::new(&plugins, &capabilities, &log);

        let mut graph = ExperimentGraph::new();
        host.run_components(&plan, &mut graph, None, true)
            .expect("dry run");
        assert!(graph.vertices().is_empty());
    }

    #[test]
    fn duplicate_object_group_import_fails() {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let root = dir.path().to_path_buf();
        write_component(&root, "objs_a", "model_component_objects = \"group\"\n");
        write_component(&root, "objs_b", "model_component_objects = \"group\"\n");
        let repository = ComponentRepository::scan(&[root]).expect("scan");
        let plan = vec![
            repository.get("objs_a").expect("component").clone(),
            repository.get("objs_b").expect("component").clone(),
        ];

        let plugins = PluginRegistry::new();
        let mut capabilities = CapabilityRegistry::new();
        capabilities.register(crate::core::graph::Capability {
            name: "group",
            requires: &[],
            attributes: Vec::new,
            init: None,
        });
        let log = log(&dir);
        let mut host = PluginHost::new(&plugins, &capabilities, &log);

        let mut graph = ExperimentGraph::new();
        let err = host
            .run_components(&plan, &mut graph, None, false)
            .expect_err("duplicate import");
        assert!(matches!(err, Error::ModelComponentImport { .. }));
    }
}
