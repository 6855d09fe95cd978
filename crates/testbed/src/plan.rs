//! Run plans.
//!
//! A [`RunPlan`] is the ordered list of services a run will bring up,
//! topologically sorted by `depends_on`. It is built once per run from the
//! declared descriptors, the enabled-service [`Selection`] and a snapshot of
//! the environment (for remote overrides), and never changes afterwards.
//! All graph errors surface here, before any container exists.

use crate::descriptor::{RemoteEndpoint, ServiceDescriptor};
use crate::errors::ConfigError;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Which declared services a run enables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every declared service starts.
    Static,
    /// Only the named services (and what they depend on) start. An empty
    /// set makes Setup a no-op.
    OptIn(BTreeSet<String>),
}

impl Selection {
    pub fn opt_in<I, S>(services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selection::OptIn(services.into_iter().map(Into::into).collect())
    }

    pub fn none() -> Self {
        Selection::OptIn(BTreeSet::new())
    }
}

/// How a planned service is made available.
#[derive(Debug, Clone)]
pub enum Placement {
    /// Start a container for it.
    Provision,
    /// Use the externally supplied endpoint; no container.
    Remote(RemoteEndpoint),
}

/// One entry of a run plan.
#[derive(Debug, Clone)]
pub struct PlannedService {
    pub descriptor: Arc<ServiceDescriptor>,
    pub placement: Placement,
}

impl PlannedService {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.placement, Placement::Remote(_))
    }
}

/// Immutable, dependency-ordered list of services for one run.
#[derive(Debug, Clone, Default)]
pub struct RunPlan {
    services: Vec<PlannedService>,
}

impl RunPlan {
    /// Build and validate a plan.
    ///
    /// Validates every declared descriptor and the whole declared dependency
    /// graph (duplicates, dangling references, cycles), then keeps the
    /// selected services plus the transitive dependencies of those that will
    /// be provisioned. Services whose remote endpoint variable is present in
    /// `env` are planned as [`Placement::Remote`] and do not pull in their
    /// own dependencies.
    pub fn build(
        declared: &[ServiceDescriptor],
        selection: &Selection,
        env: &HashMap<String, String>,
    ) -> Result<Self, ConfigError> {
        let by_name = index(declared)?;
        check_references(declared, &by_name)?;
        check_acyclic(declared, &by_name)?;

        let roots: Vec<&str> = match selection {
            Selection::Static => declared.iter().map(|d| d.name.as_str()).collect(),
            Selection::OptIn(names) => {
                for name in names {
                    if !by_name.contains_key(name.as_str()) {
                        return Err(ConfigError::UnknownService(name.clone()));
                    }
                }
                names.iter().map(String::as_str).collect()
            }
        };

        if roots.is_empty() {
            info!(target: "testbed.plan", "No services selected, plan is empty");
            return Ok(Self::default());
        }

        // Close over dependencies; remote services stop the walk.
        let mut remotes: HashMap<&str, RemoteEndpoint> = HashMap::new();
        let mut included: HashSet<&str> = HashSet::new();
        let mut stack = roots;
        while let Some(name) = stack.pop() {
            if !included.insert(name) {
                continue;
            }
            let Some(&descriptor) = by_name.get(name) else {
                continue;
            };
            if let Some(remote) = descriptor.remote.resolve(env) {
                debug!(
                    target: "testbed.plan",
                    service = %name,
                    endpoint_var = %descriptor.remote.endpoint_var,
                    "Remote override present, service will not be provisioned"
                );
                remotes.insert(name, remote);
                continue;
            }
            stack.extend(descriptor.depends_on.iter().map(String::as_str));
        }

        let services = topological_order(declared, &by_name)
            .into_iter()
            .filter(|d| included.contains(d.name.as_str()))
            .map(|d| PlannedService {
                descriptor: Arc::new(d.clone()),
                placement: match remotes.remove(d.name.as_str()) {
                    Some(remote) => Placement::Remote(remote),
                    None => Placement::Provision,
                },
            })
            .collect::<Vec<_>>();

        info!(
            target: "testbed.plan",
            services = ?services.iter().map(PlannedService::name).collect::<Vec<_>>(),
            remote = services.iter().filter(|s| s.is_remote()).count(),
            "Run plan built"
        );

        Ok(Self { services })
    }

    pub fn services(&self) -> &[PlannedService] {
        &self.services
    }

    pub fn names(&self) -> Vec<&str> {
        self.services.iter().map(PlannedService::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlannedService> {
        self.services.iter().find(|s| s.name() == name)
    }

    /// Entries that need a container, in start order.
    pub fn provisioned(&self) -> impl Iterator<Item = &PlannedService> {
        self.services.iter().filter(|s| !s.is_remote())
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

fn index(declared: &[ServiceDescriptor]) -> Result<HashMap<&str, &ServiceDescriptor>, ConfigError> {
    let mut by_name = HashMap::with_capacity(declared.len());
    for descriptor in declared {
        descriptor.validate()?;
        if by_name.insert(descriptor.name.as_str(), descriptor).is_some() {
            return Err(ConfigError::DuplicateService(descriptor.name.clone()));
        }
    }
    Ok(by_name)
}

fn check_references(
    declared: &[ServiceDescriptor],
    by_name: &HashMap<&str, &ServiceDescriptor>,
) -> Result<(), ConfigError> {
    for descriptor in declared {
        for dependency in &descriptor.depends_on {
            if !by_name.contains_key(dependency.as_str()) {
                return Err(ConfigError::UnknownDependency {
                    service: descriptor.name.clone(),
                    dependency: dependency.clone(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Depth-first search with an explicit path so the error shows the cycle.
fn check_acyclic(
    declared: &[ServiceDescriptor],
    by_name: &HashMap<&str, &ServiceDescriptor>,
) -> Result<(), ConfigError> {
    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a ServiceDescriptor>,
        marks: &mut HashMap<&'a str, Mark>,
        path: &mut Vec<&'a str>,
    ) -> Result<(), ConfigError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = path.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path.iter().skip(start).map(|n| (*n).to_string()).collect();
                cycle.push(name.to_string());
                return Err(ConfigError::DependencyCycle { cycle });
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        path.push(name);
        if let Some(&descriptor) = by_name.get(name) {
            for dependency in &descriptor.depends_on {
                visit(dependency.as_str(), by_name, marks, path)?;
            }
        }
        path.pop();
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let mut marks = HashMap::new();
    let mut path = Vec::new();
    for descriptor in declared {
        visit(descriptor.name.as_str(), by_name, &mut marks, &mut path)?;
    }
    Ok(())
}

/// Dependencies first, otherwise declaration order. Assumes an acyclic graph.
fn topological_order<'a>(
    declared: &'a [ServiceDescriptor],
    by_name: &HashMap<&str, &'a ServiceDescriptor>,
) -> Vec<&'a ServiceDescriptor> {
    fn visit<'a>(
        descriptor: &'a ServiceDescriptor,
        by_name: &HashMap<&str, &'a ServiceDescriptor>,
        visited: &mut HashSet<&'a str>,
        result: &mut Vec<&'a ServiceDescriptor>,
    ) {
        if !visited.insert(descriptor.name.as_str()) {
            return;
        }
        for dependency in &descriptor.depends_on {
            if let Some(&dep) = by_name.get(dependency.as_str()) {
                visit(dep, by_name, visited, result);
            }
        }
        result.push(descriptor);
    }

    let mut result = Vec::with_capacity(declared.len());
    let mut visited = HashSet::new();
    for descriptor in declared {
        visit(descriptor, by_name, &mut visited, &mut result);
    }
    result
}
