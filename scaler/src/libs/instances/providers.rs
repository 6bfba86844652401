//! The chain of providers that decides which instance types can be launched

use gridscale::conf::InstanceSelection;
use gridscale::models::{InstanceDescriptor, family};
use gridscale::Error;
use itertools::Itertools;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{Level, event, instrument};

use super::AvailabilityTracker;
use crate::libs::provisioners::Provisioner;

/// Every instance type the cloud offers
///
/// This is loaded once at startup and refreshed on demand.
pub struct InstanceCatalog {
    /// The provisioner to load instance types from
    provisioner: Arc<dyn Provisioner>,
    /// The instance types that were last loaded
    instances: RwLock<Vec<InstanceDescriptor>>,
}

impl InstanceCatalog {
    /// Load a new catalog
    ///
    /// # Arguments
    ///
    /// * `provisioner` - The provisioner to load instance types from
    pub async fn load(provisioner: Arc<dyn Provisioner>) -> Result<Self, Error> {
        let instances = provisioner.instance_types().await?;
        Ok(InstanceCatalog {
            provisioner,
            instances: RwLock::new(instances),
        })
    }

    /// Reload every instance type the cloud offers
    #[instrument(name = "InstanceCatalog::refresh", skip_all, err(Debug))]
    pub async fn refresh(&self) -> Result<(), Error> {
        let instances = self.provisioner.instance_types().await?;
        event!(Level::INFO, instances = instances.len());
        *self.instances.write().await = instances;
        Ok(())
    }

    /// Get every instance type the cloud offers
    pub async fn all(&self) -> Vec<InstanceDescriptor> {
        self.instances.read().await.clone()
    }

    /// Get a single instance type by name
    ///
    /// # Arguments
    ///
    /// * `name` - The name of the instance type to get
    pub async fn get(&self, name: &str) -> Option<InstanceDescriptor> {
        self.instances
            .read()
            .await
            .iter()
            .find(|instance| instance.name == name)
            .cloned()
    }
}

/// Something that provides the instance types that can be launched
#[async_trait::async_trait]
pub trait InstanceProvider: Send + Sync {
    /// Get the instance types that can be launched right now
    async fn provide(&self) -> Vec<InstanceDescriptor>;
}

/// Provides only the configured instance type
pub struct BaseProvider {
    /// The instance type to provide
    name: String,
    /// The catalog to look this instance type up in
    catalog: Arc<InstanceCatalog>,
}

#[async_trait::async_trait]
impl InstanceProvider for BaseProvider {
    async fn provide(&self) -> Vec<InstanceDescriptor> {
        self.catalog.get(&self.name).await.into_iter().collect()
    }
}

/// Provides every instance type in the configured instance type's family
pub struct FamilyProvider {
    /// The family to provide
    family: String,
    /// The catalog to look instance types up in
    catalog: Arc<InstanceCatalog>,
}

#[async_trait::async_trait]
impl InstanceProvider for FamilyProvider {
    async fn provide(&self) -> Vec<InstanceDescriptor> {
        self.catalog
            .all()
            .await
            .into_iter()
            .filter(|instance| instance.family() == self.family)
            .collect()
    }
}

/// Drops instance types with too many cpus
pub struct SizeCapProvider {
    /// The provider to filter
    inner: Box<dyn InstanceProvider>,
    /// The most cpus an instance type may have
    max_cpu: u64,
}

#[async_trait::async_trait]
impl InstanceProvider for SizeCapProvider {
    async fn provide(&self) -> Vec<InstanceDescriptor> {
        let mut instances = self.inner.provide().await;
        instances.retain(|instance| instance.cpu <= self.max_cpu);
        instances
    }
}

/// Orders instance types from the biggest to the smallest
pub struct DescendingProvider {
    /// The provider to order
    inner: Box<dyn InstanceProvider>,
}

#[async_trait::async_trait]
impl InstanceProvider for DescendingProvider {
    async fn provide(&self) -> Vec<InstanceDescriptor> {
        self.inner
            .provide()
            .await
            .into_iter()
            .sorted_by(|left, right| {
                (right.cpu, right.mem, right.gpu).cmp(&(left.cpu, left.mem, left.gpu))
            })
            .collect()
    }
}

/// Drops instance types that recently failed to launch
pub struct AvailableProvider {
    /// The provider to filter
    inner: Box<dyn InstanceProvider>,
    /// The recent launch failures
    tracker: Arc<AvailabilityTracker>,
}

#[async_trait::async_trait]
impl InstanceProvider for AvailableProvider {
    async fn provide(&self) -> Vec<InstanceDescriptor> {
        let mut available = Vec::default();
        for instance in self.inner.provide().await {
            if self.tracker.is_available(&instance.name).await {
                available.push(instance);
            } else {
                event!(Level::DEBUG, unavailable = &instance.name);
            }
        }
        available
    }
}

/// Build the provider chain for our settings
///
/// # Arguments
///
/// * `conf` - The instance selection settings
/// * `catalog` - The instance types the cloud offers
/// * `tracker` - The recent launch failures
pub fn chain(
    conf: &InstanceSelection,
    catalog: &Arc<InstanceCatalog>,
    tracker: &Arc<AvailabilityTracker>,
) -> Box<dyn InstanceProvider> {
    // start with either the configured type or its whole family
    let mut provider: Box<dyn InstanceProvider> = if conf.family {
        Box::new(FamilyProvider {
            family: family(&conf.instance_type),
            catalog: catalog.clone(),
        })
    } else {
        Box::new(BaseProvider {
            name: conf.instance_type.clone(),
            catalog: catalog.clone(),
        })
    };
    if let Some(max_cpu) = conf.max_cpu {
        provider = Box::new(SizeCapProvider {
            inner: provider,
            max_cpu,
        });
    }
    if conf.descending {
        provider = Box::new(DescendingProvider { inner: provider });
    }
    if conf.availability {
        provider = Box::new(AvailableProvider {
            inner: provider,
            tracker: tracker.clone(),
        });
    }
    provider
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::libs::provisioners::DryRunProvisioner;

    /// Build a catalog of a few instance types
    async fn catalog() -> Arc<InstanceCatalog> {
        let instances = vec![
            InstanceDescriptor::new("m5.large", 2, 0, 8),
            InstanceDescriptor::new("m5.4xlarge", 16, 0, 64),
            InstanceDescriptor::new("m5.xlarge", 4, 0, 16),
            InstanceDescriptor::new("c5.xlarge", 4, 0, 8),
        ];
        let provisioner = Arc::new(DryRunProvisioner::new(instances));
        Arc::new(InstanceCatalog::load(provisioner).await.unwrap())
    }

    #[tokio::test]
    async fn family_chain() {
        let catalog = catalog().await;
        let tracker = Arc::new(AvailabilityTracker::new(600));
        let conf = InstanceSelection {
            instance_type: "m5.large".to_owned(),
            family: true,
            max_cpu: Some(8),
            ..InstanceSelection::default()
        };
        tracker.failed("m5.xlarge").await;
        let names: Vec<String> = chain(&conf, &catalog, &tracker)
            .provide()
            .await
            .into_iter()
            .map(|instance| instance.name)
            .collect();
        // the 16 cpu type is capped and the xlarge recently failed
        assert_eq!(names, vec!["m5.large".to_owned()]);
    }

    #[tokio::test]
    async fn descending_family() {
        let catalog = catalog().await;
        let tracker = Arc::new(AvailabilityTracker::new(600));
        let conf = InstanceSelection {
            instance_type: "m5.xlarge".to_owned(),
            family: true,
            ..InstanceSelection::default()
        };
        let cpus: Vec<u64> = chain(&conf, &catalog, &tracker)
            .provide()
            .await
            .iter()
            .map(|instance| instance.cpu)
            .collect();
        assert_eq!(cpus, vec![16, 4, 2]);
    }

    #[tokio::test]
    async fn base_only() {
        let catalog = catalog().await;
        let tracker = Arc::new(AvailabilityTracker::new(600));
        let conf = InstanceSelection {
            instance_type: "c5.xlarge".to_owned(),
            ..InstanceSelection::default()
        };
        let instances = chain(&conf, &catalog, &tracker).provide().await;
        assert_eq!(instances, vec![InstanceDescriptor::new("c5.xlarge", 4, 0, 8)]);
        // unknown instance types provide nothing
        let conf = InstanceSelection {
            instance_type: "z9.huge".to_owned(),
            ..InstanceSelection::default()
        };
        assert!(chain(&conf, &catalog, &tracker).provide().await.is_empty());
    }
}
