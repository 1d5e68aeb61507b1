//! Validator endpoint selection

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashSet;

use super::ValidatorDirectory;

/// Draw up to `count` distinct endpoints uniformly at random.
pub fn sample_endpoints(endpoints: &[String], count: usize) -> Vec<String> {
    let mut pool: Vec<String> = endpoints.to_vec();
    fastrand::shuffle(&mut pool);
    pool.truncate(count);
    pool
}

/// Directory over a fixed list of known validator endpoints.
///
/// Every call samples afresh, so two consecutive selections are independent.
pub struct StaticValidatorDirectory {
    endpoints: RwLock<Vec<String>>,
}

impl StaticValidatorDirectory {
    pub fn new(endpoints: Vec<String>) -> Self {
        Self {
            endpoints: RwLock::new(endpoints),
        }
    }

    /// Replace the known endpoint list
    pub fn set_endpoints(&self, endpoints: Vec<String>) {
        *self.endpoints.write() = endpoints;
    }

    pub fn len(&self) -> usize {
        self.endpoints.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.read().is_empty()
    }
}

#[async_trait]
impl ValidatorDirectory for StaticValidatorDirectory {
    async fn select_endpoints(
        &self,
        quorum_size: usize,
        exclude: &HashSet<String>,
    ) -> Result<Vec<String>> {
        let candidates: Vec<String> = self
            .endpoints
            .read()
            .iter()
            .filter(|endpoint| !exclude.contains(*endpoint))
            .cloned()
            .collect();

        if candidates.len() < quorum_size {
            tracing::warn!(
                available = candidates.len(),
                excluded = exclude.len(),
                quorum_size,
                "Fewer validator endpoints than quorum after exclusions"
            );
        }

        Ok(sample_endpoints(&candidates, quorum_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("https://dn{}.test", i)).collect()
    }

    #[test]
    fn test_sample_is_distinct_and_bounded() {
        let all = endpoints(10);
        let picked = sample_endpoints(&all, 4);
        assert_eq!(picked.len(), 4);
        let unique: HashSet<_> = picked.iter().collect();
        assert_eq!(unique.len(), 4);
        assert!(picked.iter().all(|p| all.contains(p)));

        assert_eq!(sample_endpoints(&all[..2], 5).len(), 2);
    }

    #[tokio::test]
    async fn test_selection_skips_excluded() {
        let all = endpoints(5);
        let directory = StaticValidatorDirectory::new(all.clone());
        let exclude: HashSet<String> = all[..3].iter().cloned().collect();

        let picked = directory.select_endpoints(3, &exclude).await.unwrap();
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(|p| !exclude.contains(p)));
    }

    #[tokio::test]
    async fn test_set_endpoints_replaces_list() {
        let directory = StaticValidatorDirectory::new(endpoints(2));
        directory.set_endpoints(vec!["https://other.test".to_string()]);
        assert_eq!(directory.len(), 1);

        let picked = directory
            .select_endpoints(1, &HashSet::new())
            .await
            .unwrap();
        assert_eq!(picked, vec!["https://other.test".to_string()]);
    }
}
