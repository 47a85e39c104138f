//! The context: configuration, the immutable AM table and the capability
//! registry enumerating every (transport, device) resource workers may
//! open.

use std::sync::Arc;

use crate::am::{AmDef, AmTable};
use crate::config::{ContextConfig, TlsFilter, WorkerParams};
use crate::status::{Result, Status};
use crate::tl::{Component, Resource};
use crate::worker::Worker;

pub(crate) struct ContextResource {
    pub component: Arc<dyn Component>,
    pub resource: Resource,
}

/// Process-level state shared by all workers created from it.
pub struct Context {
    config: ContextConfig,
    am_table: AmTable,
    resources: Vec<ContextResource>,
}

impl Context {
    /// Build a context: validate the AM table and enumerate transport
    /// resources, honoring the [`TLS_ENV`](crate::config::TLS_ENV) filter.
    ///
    /// Fails with [`Status::NoDevice`] when no resource remains.
    pub fn new(config: ContextConfig, am_defs: &'static [AmDef]) -> Result<Arc<Context>> {
        let am_table = AmTable::new(am_defs)?;
        let filter = TlsFilter::from_env();

        let mut resources = Vec::new();
        for component in &config.components {
            if !filter.admits(component.name()) {
                log::debug!("context: transport {} filtered out", component.name());
                continue;
            }
            for resource in component.resources() {
                log::debug!(
                    "context: resource {}/{} (md {})",
                    resource.desc.tl_name,
                    resource.desc.dev_name,
                    resource.desc.md_index,
                );
                resources.push(ContextResource {
                    component: component.clone(),
                    resource,
                });
            }
        }
        if resources.is_empty() {
            log::warn!("context: no usable transport resources");
            return Err(Status::NoDevice);
        }

        Ok(Arc::new(Context {
            config,
            am_table,
            resources,
        }))
    }

    /// Create a worker bound to this context.
    pub fn worker(self: &Arc<Self>, params: &WorkerParams) -> Result<Worker> {
        Worker::create(self.clone(), params)
    }

    /// Number of enumerated (transport, device) resources, the `num_tls`
    /// every worker's dense arrays are sized by.
    pub fn num_resources(&self) -> usize {
        self.resources.len()
    }

    pub(crate) fn config(&self) -> &ContextConfig {
        &self.config
    }

    pub(crate) fn am_table(&self) -> AmTable {
        self.am_table
    }

    pub(crate) fn resources(&self) -> &[ContextResource] {
        &self.resources
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_component_set_is_no_device() {
        let config = ContextConfig {
            components: Vec::new(),
            ..ContextConfig::default()
        };
        assert_eq!(Context::new(config, &[]).err(), Some(Status::NoDevice));
    }

    #[test]
    fn default_config_enumerates_loopback() {
        let context = Context::new(ContextConfig::default(), &[]).unwrap();
        assert_eq!(context.num_resources(), 1);
        assert_eq!(context.resources()[0].resource.desc.tl_name, "loopback");
    }
}
