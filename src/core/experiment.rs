use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

use crate::config::Config;
use crate::core::component::ComponentRepository;
use crate::core::coordination::{CoordinationClient, VmMapping};
use crate::core::graph::{CapabilityRegistry, ExperimentGraph, VertexId};
use crate::core::logs::{unix_timestamp_seconds, LogSink};
use crate::core::plugin::{ComponentRunReport, PluginHost, PluginRegistry};
use crate::core::resolver::Resolver;
use crate::core::schedule::ScheduleEntry;
use crate::core::schedule_store::ScheduleDb;
use crate::core::store::FileStore;
use crate::error::{Error, Result};

/// Options for one experiment build.
#[derive(Debug, Clone)]
pub struct ExperimentOptions {
    /// Seed model component names, in operator order.
    pub seeds: Vec<String>,
    /// Repository directories scanned for installed components.
    pub repositories: Vec<PathBuf>,
    /// Check imports and the plan without running plugins or uploading.
    pub dry_run: bool,
}

/// What a build produced.
#[derive(Debug)]
pub struct ExperimentSummary {
    /// The ordered plan that was executed.
    pub plan: Vec<String>,
    pub reports: Vec<ComponentRunReport>,
    /// VMs whose schedules were published.
    pub vms: Vec<String>,
}

/// One VM discovered on the experiment graph, read from the `vm` attribute
/// plugins attach to endpoint vertices.
struct GraphVm {
    name: String,
    uuid: String,
    control_ip: Option<String>,
    schedule: Vec<ScheduleEntry>,
}

/// Resolve the seed list, run every plugin in order, upload referenced
/// artifacts, publish per-VM schedules, and stamp the launch time.
pub fn launch_experiment(
    config: &Config,
    plugins: &PluginRegistry,
    capabilities: &CapabilityRegistry,
    options: &ExperimentOptions,
    log: &LogSink,
) -> Result<ExperimentSummary> {
    let repository = ComponentRepository::scan(&options.repositories)?;
    let resolver = Resolver::new(&repository, &config.attribute_defaults, log);
    let plan = resolver.resolve(&options.seeds)?;
    let plan_names: Vec<String> = plan.iter().map(|mc| mc.name.clone()).collect();
    log.info(&format!("resolved plan: {plan_names:?}"));

    let mut graph = ExperimentGraph::new();
    let mut host = PluginHost::new(plugins, capabilities, log);

    let stores = if options.dry_run {
        None
    } else {
        Some((
            FileStore::vm_resources(config, log.clone())?,
            FileStore::images(config, log.clone())?,
        ))
    };
    let store_refs: Option<(&FileStore, &FileStore)> =
        stores.as_ref().map(|(vmr, images)| (vmr, images));

    let reports = host.run_components(&plan, &mut graph, store_refs, options.dry_run)?;

    let vms = collect_vms(&graph)?;
    let vm_names: Vec<String> = vms.iter().map(|vm| vm.name.clone()).collect();

    if !options.dry_run {
        publish_vms(config, &vms)?;
    }

    Ok(ExperimentSummary {
        plan: plan_names,
        reports,
        vms: vm_names,
    })
}

/// Walk the graph's VM vertices: any vertex carrying a `vm` data attribute
/// with at least a `name` is part of the experiment's VM set.
fn collect_vms(graph: &ExperimentGraph) -> Result<Vec<GraphVm>> {
    let mut vms = Vec::new();
    for vertex in graph.vertices() {
        let decorable = graph.vertex(vertex)?;
        let Some(vm) = decorable.get("vm") else {
            continue;
        };
        let Some(name) = vm.get("name").and_then(Value::as_str) else {
            continue;
        };
        let uuid = vm
            .get("uuid")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| derived_uuid(graph, vertex, name));
        let control_ip = vm
            .get("control_ip")
            .and_then(Value::as_str)
            .map(str::to_string);

        let schedule = match decorable.get("schedule") {
            Some(value) => serde_json::from_value(value.clone()).map_err(|err| {
                Error::Internal {
                    detail: format!("vertex {name} carries an unparseable schedule: {err}"),
                }
            })?,
            None => Vec::new(),
        };

        vms.push(GraphVm {
            name: name.to_string(),
            uuid,
            control_ip,
            schedule,
        });
    }
    Ok(vms)
}

fn derived_uuid(graph: &ExperimentGraph, vertex: VertexId, name: &str) -> String {
    format!("{}-{}-{name}", graph.graph_id(), vertex.0)
}

/// Write every VM's schedule and registry record, then mark the experiment
/// launched. The start-time barrier is armed by clearing any stale
/// timestamps first.
fn publish_vms(config: &Config, vms: &[GraphVm]) -> Result<()> {
    let client = Arc::new(CoordinationClient::connect(
        &config.grpc.hostname,
        config.grpc.port,
        &config.grpc.db,
    )?);
    let schedule_db = ScheduleDb::new(Arc::clone(&client));

    client.initialize_experiment_start_time()?;
    for vm in vms {
        schedule_db.put(&vm.name, &vm.schedule)?;
        client.set_vm_mapping(VmMapping {
            server_uuid: vm.uuid.clone(),
            server_name: vm.name.clone(),
            control_ip: vm.control_ip.clone(),
            state: config.vm_resource_manager.default_state.clone(),
            current_time: 0,
        })?;
    }
    client.set_experiment_launch_time(unix_timestamp_seconds())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::core::graph::ExperimentGraph;

    #[test]
    fn vm_set_is_read_from_vertex_attributes() {
        let mut graph = ExperimentGraph::new();
        let with_vm = graph.add_vertex(Some("host-1"));
        graph.vertex_mut(with_vm).expect("vertex").set(
            "vm",
            json!({"name": "host-1", "uuid": "uuid-1"}),
        );
        graph
            .vertex_mut(with_vm)
            .expect("vertex")
            .set("schedule", json!([{"start_time": -10, "executable": "a.sh"}]));
        let plain = graph.add_vertex(Some("switch-1"));
        graph
            .vertex_mut(plain)
            .expect("vertex")
            .set("role", json!("switch"));

        let vms = collect_vms(&graph).expect("collect");
        assert_eq!(vms.len(), 1);
        assert_eq!(vms[0].name, "host-1");
        assert_eq!(vms[0].uuid, "uuid-1");
        assert_eq!(vms[0].schedule.len(), 1);
        assert_eq!(vms[0].schedule[0].start_time, -10);
    }

    #[test]
    fn vms_without_uuid_get_a_stable_derived_one() {
        let mut graph = ExperimentGraph::new();
        let vertex = graph.add_vertex(Some("host-2"));
        graph
            .vertex_mut(vertex)
            .expect("vertex")
            .set("vm", json!({"name": "host-2"}));
        let vms = collect_vms(&graph).expect("collect");
        assert!(vms[0].uuid.contains("host-2"));
    }
}
