use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;

use crate::error::{Error, Result};

static NEXT_GRAPH_ID: AtomicU64 = AtomicU64::new(1);

/// An attribute merged into a decorable instance: either a data value or an
/// operation dispatched by name.
#[derive(Clone)]
pub enum AttrValue {
    Data(Value),
    Op(OpFn),
}

/// Operation signature: operations receive the instance they are attached
/// to plus a JSON argument value, and return a JSON result.
pub type OpFn = fn(&mut Decorable, &Value) -> Result<Value>;

impl fmt::Debug for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Data(value) => write!(f, "Data({value})"),
            AttrValue::Op(_) => write!(f, "Op(..)"),
        }
    }
}

/// A conflict handler inspects a colliding attribute and either resolves it
/// to a merged value or returns `None`, meaning "not my conflict" so the
/// next registered handler is consulted.
pub type ConflictHandler = fn(&str, &AttrValue, &AttrValue) -> Option<AttrValue>;

/// A named mix-in capability: the attributes it contributes, capabilities it
/// requires first, and an optional initializer run after the merge.
#[derive(Clone)]
pub struct Capability {
    pub name: &'static str,
    pub requires: &'static [&'static str],
    pub attributes: fn() -> Vec<(String, AttrValue)>,
    pub init: Option<fn(&mut Decorable) -> Result<()>>,
}

/// Registry of capabilities contributed by model component object groups.
#[derive(Default)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<&'static str, Capability>,
}

impl CapabilityRegistry {
    pub fn new() -> CapabilityRegistry {
        CapabilityRegistry::default()
    }

    pub fn register(&mut self, capability: Capability) {
        self.capabilities.insert(capability.name, capability);
    }

    pub fn get(&self, name: &str) -> Option<&Capability> {
        self.capabilities.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }
}

/// Per-instance decoration state: the applied-capability set (which doubles
/// as the capability cache), the merged attribute map, and the ordered
/// conflict-handler list.
#[derive(Default)]
pub struct Decorable {
    applied: Vec<String>,
    attributes: BTreeMap<String, AttrValue>,
    conflict_handlers: Vec<ConflictHandler>,
}

impl Decorable {
    pub fn new() -> Decorable {
        Decorable::default()
    }

    /// Apply a capability by name, applying unmet prerequisites first.
    ///
    /// Attribute collisions consult the registered conflict handlers in
    /// insertion order; if none resolves, the decoration fails. Applying the
    /// same capability twice fails.
    pub fn decorate(&mut self, registry: &CapabilityRegistry, name: &str) -> Result<()> {
        if self.applied.iter().any(|applied| applied == name) {
            return Err(Error::AlreadyDecorated {
                capability: name.to_string(),
            });
        }
        let capability = registry.get(name).ok_or_else(|| Error::NotFound {
            store: "capability registry".to_string(),
            name: name.to_string(),
        })?;
        let capability = capability.clone();

        for required in capability.requires {
            if !self.is_decorated_by(required) {
                self.decorate(registry, required)?;
            }
        }

        let mut merged: Vec<(String, AttrValue)> = Vec::new();
        for (attr_name, new_value) in (capability.attributes)() {
            match self.attributes.get(&attr_name) {
                None => merged.push((attr_name, new_value)),
                Some(existing) => {
                    let resolved = self
                        .conflict_handlers
                        .iter()
                        .find_map(|handler| handler(&attr_name, &new_value, existing));
                    match resolved {
                        Some(value) => merged.push((attr_name, value)),
                        None => {
                            return Err(Error::DecoratorConflict {
                                capability: name.to_string(),
                                attribute: attr_name,
                            });
                        }
                    }
                }
            }
        }

        for (attr_name, value) in merged {
            self.attributes.insert(attr_name, value);
        }
        self.applied.push(name.to_string());

        if let Some(init) = capability.init {
            init(self)?;
        }
        Ok(())
    }

    pub fn add_conflict_handler(&mut self, handler: ConflictHandler) {
        self.conflict_handlers.push(handler);
    }

    pub fn is_decorated_by(&self, name: &str) -> bool {
        self.applied.iter().any(|applied| applied == name)
    }

    /// Applied capabilities in application order.
    pub fn capabilities(&self) -> &[String] {
        &self.applied
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        match self.attributes.get(name) {
            Some(AttrValue::Data(value)) => Some(value),
            _ => None,
        }
    }

    pub fn set(&mut self, name: &str, value: Value) {
        self.attributes.insert(name.to_string(), AttrValue::Data(value));
    }

    pub fn unset(&mut self, name: &str) -> bool {
        self.attributes.remove(name).is_some()
    }

    pub fn has(&self, name: &str) -> bool {
        self.attributes.contains_key(name)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.attributes.keys().map(String::as_str)
    }

    /// Dispatch a named operation attached by some capability.
    pub fn call(&mut self, name: &str, args: &Value) -> Result<Value> {
        let Some(AttrValue::Op(op)) = self.attributes.get(name) else {
            return Err(Error::NotFound {
                store: "instance operations".to_string(),
                name: name.to_string(),
            });
        };
        let op = *op;
        op(self, args)
    }
}

/// Identifier of a vertex within one experiment graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VertexId(pub u64);

struct VertexData {
    name: Option<String>,
    valid: bool,
    decorable: Decorable,
}

struct EdgeData {
    decorable: Decorable,
}

/// Undirected experiment graph with decorable vertices and edges.
///
/// Vertices are equal iff they belong to the same graph and carry the same
/// integer id. A deleted vertex leaves a tombstone: every subsequent
/// operation on its id fails.
pub struct ExperimentGraph {
    graph_id: u64,
    vertices: BTreeMap<u64, VertexData>,
    adjacency: BTreeMap<u64, BTreeSet<u64>>,
    edges: BTreeMap<(u64, u64), EdgeData>,
    next_vertex_id: u64,
}

impl Default for ExperimentGraph {
    fn default() -> Self {
        ExperimentGraph::new()
    }
}

impl ExperimentGraph {
    pub fn new() -> ExperimentGraph {
        ExperimentGraph {
            graph_id: NEXT_GRAPH_ID.fetch_add(1, Ordering::Relaxed),
            vertices: BTreeMap::new(),
            adjacency: BTreeMap::new(),
            edges: BTreeMap::new(),
            next_vertex_id: 0,
        }
    }

    pub fn graph_id(&self) -> u64 {
        self.graph_id
    }

    pub fn add_vertex(&mut self, name: Option<&str>) -> VertexId {
        let id = self.next_vertex_id;
        self.next_vertex_id += 1;
        self.vertices.insert(
            id,
            VertexData {
                name: name.map(str::to_string),
                valid: true,
                decorable: Decorable::new(),
            },
        );
        self.adjacency.insert(id, BTreeSet::new());
        VertexId(id)
    }

    fn live_vertex(&self, vertex: VertexId) -> Result<&VertexData> {
        match self.vertices.get(&vertex.0) {
            Some(data) if data.valid => Ok(data),
            _ => Err(Error::NoSuchVertex { id: vertex.0 }),
        }
    }

    fn live_vertex_mut(&mut self, vertex: VertexId) -> Result<&mut VertexData> {
        match self.vertices.get_mut(&vertex.0) {
            Some(data) if data.valid => Ok(data),
            _ => Err(Error::NoSuchVertex { id: vertex.0 }),
        }
    }

    pub fn vertex_name(&self, vertex: VertexId) -> Result<Option<String>> {
        Ok(self.live_vertex(vertex)?.name.clone())
    }

    pub fn vertex(&self, vertex: VertexId) -> Result<&Decorable> {
        Ok(&self.live_vertex(vertex)?.decorable)
    }

    pub fn vertex_mut(&mut self, vertex: VertexId) -> Result<&mut Decorable> {
        Ok(&mut self.live_vertex_mut(vertex)?.decorable)
    }

    /// Delete a vertex and its incident edges, leaving a tombstone.
    pub fn delete_vertex(&mut self, vertex: VertexId) -> Result<()> {
        self.live_vertex_mut(vertex)?.valid = false;
        let neighbors = self.adjacency.remove(&vertex.0).unwrap_or_default();
        for neighbor in neighbors {
            if let Some(back) = self.adjacency.get_mut(&neighbor) {
                back.remove(&vertex.0);
            }
            self.edges.remove(&edge_key(vertex.0, neighbor));
        }
        Ok(())
    }

    /// Add (or fetch) the undirected edge between two live vertices.
    pub fn add_edge(&mut self, a: VertexId, b: VertexId) -> Result<()> {
        self.live_vertex(a)?;
        self.live_vertex(b)?;
        let key = edge_key(a.0, b.0);
        self.adjacency.entry(a.0).or_default().insert(b.0);
        self.adjacency.entry(b.0).or_default().insert(a.0);
        self.edges.entry(key).or_insert_with(|| EdgeData {
            decorable: Decorable::new(),
        });
        Ok(())
    }

    /// Find the edge between two endpoints, in either order.
    pub fn find_edge(&self, a: VertexId, b: VertexId) -> Option<(VertexId, VertexId)> {
        let key = edge_key(a.0, b.0);
        self.edges
            .get(&key)
            .map(|_| (VertexId(key.0), VertexId(key.1)))
    }

    pub fn edge(&self, a: VertexId, b: VertexId) -> Result<&Decorable> {
        self.edges
            .get(&edge_key(a.0, b.0))
            .map(|data| &data.decorable)
            .ok_or(Error::NoSuchVertex { id: a.0 })
    }

    pub fn edge_mut(&mut self, a: VertexId, b: VertexId) -> Result<&mut Decorable> {
        self.edges
            .get_mut(&edge_key(a.0, b.0))
            .map(|data| &mut data.decorable)
            .ok_or(Error::NoSuchVertex { id: a.0 })
    }

    pub fn delete_edge(&mut self, a: VertexId, b: VertexId) {
        let key = edge_key(a.0, b.0);
        if self.edges.remove(&key).is_some() {
            if let Some(neighbors) = self.adjacency.get_mut(&a.0) {
                neighbors.remove(&b.0);
            }
            if let Some(neighbors) = self.adjacency.get_mut(&b.0) {
                neighbors.remove(&a.0);
            }
        }
    }

    pub fn neighbors(&self, vertex: VertexId) -> Result<Vec<VertexId>> {
        self.live_vertex(vertex)?;
        Ok(self
            .adjacency
            .get(&vertex.0)
            .map(|neighbors| neighbors.iter().map(|&id| VertexId(id)).collect())
            .unwrap_or_default())
    }

    pub fn degree(&self, vertex: VertexId) -> Result<usize> {
        Ok(self.neighbors(vertex)?.len())
    }

    /// Live vertices in id order.
    pub fn vertices(&self) -> Vec<VertexId> {
        self.vertices
            .iter()
            .filter(|(_, data)| data.valid)
            .map(|(&id, _)| VertexId(id))
            .collect()
    }

    pub fn edges(&self) -> Vec<(VertexId, VertexId)> {
        self.edges
            .keys()
            .map(|&(a, b)| (VertexId(a), VertexId(b)))
            .collect()
    }

    /// First live vertex with the given name.
    pub fn find_vertex(&self, name: &str) -> Option<VertexId> {
        self.vertices
            .iter()
            .find(|(_, data)| data.valid && data.name.as_deref() == Some(name))
            .map(|(&id, _)| VertexId(id))
    }
}

fn edge_key(a: u64, b: u64) -> (u64, u64) {
    if a <= b { (a, b) } else { (b, a) }
}
