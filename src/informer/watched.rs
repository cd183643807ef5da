use dashmap::DashSet;

/// Concurrent set of resource keywords someone subscribes to.
///
/// Read on every publish, written rarely (start-up, reconfiguration).
#[derive(Debug, Default)]
pub struct WatchedResources {
    resources: DashSet<String>,
}

impl WatchedResources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<I, S>(
        &self,
        resources: I,
    ) where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for resource in resources {
            self.resources.insert(resource.into());
        }
    }

    pub fn delete<I, S>(
        &self,
        resources: I,
    ) where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for resource in resources {
            self.resources.remove(resource.as_ref());
        }
    }

    pub fn has(
        &self,
        resource: &str,
    ) -> bool {
        self.resources.contains(resource)
    }

    pub fn list(&self) -> Vec<String> {
        let mut all: Vec<String> = self.resources.iter().map(|r| r.key().clone()).collect();
        all.sort();
        all
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
