//! Distribution Router
//!
//! Invokes the configured policies and refuses any answer that names a
//! slice outside the active list. Nothing downstream ever routes a write or
//! a query to an unconfigured or inactive slice.

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use super::instance::Entity;
use super::policy::{DistributionPolicy, QueryTargetPolicy, ReplicationPolicy, RoutingContext};
use crate::error::{Error, Result};
use crate::meta::MetadataRepository;
use crate::query::Args;

/// Slice assignment of a managed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SliceInfo {
    replicated: bool,
    /// Ordered, no duplicates
    targets: Vec<String>,
}

impl SliceInfo {
    /// Assignment to exactly one slice
    pub fn single(slice: impl Into<String>) -> Self {
        Self {
            replicated: false,
            targets: vec![slice.into()],
        }
    }

    /// Assignment of a replicated instance
    pub fn replicated(targets: Vec<String>) -> Self {
        Self {
            replicated: true,
            targets,
        }
    }

    pub fn is_replicated(&self) -> bool {
        self.replicated
    }

    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

/// Policy invocation plus validation
pub struct DistributionRouter {
    metadata: Arc<MetadataRepository>,
    distribution: Arc<dyn DistributionPolicy>,
    replication: Arc<dyn ReplicationPolicy>,
    query_target: Arc<dyn QueryTargetPolicy>,
}

impl std::fmt::Debug for DistributionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributionRouter")
            .field("distribution", &self.distribution.name())
            .field("replication", &self.replication.name())
            .field("query_target", &self.query_target.name())
            .finish()
    }
}

impl DistributionRouter {
    pub fn new(
        metadata: Arc<MetadataRepository>,
        distribution: Arc<dyn DistributionPolicy>,
        replication: Arc<dyn ReplicationPolicy>,
        query_target: Arc<dyn QueryTargetPolicy>,
    ) -> Self {
        Self {
            metadata,
            distribution,
            replication,
            query_target,
        }
    }

    /// Choose the target slice(s) of a new instance.
    ///
    /// Replicated types go through the replication policy and may land on
    /// several slices; everything else goes through the distribution
    /// policy and lands on exactly one.
    pub fn route(&self, instance: &Entity, active: &[String], ctx: &RoutingContext) -> Result<SliceInfo> {
        let meta = self.metadata.entity(instance.type_name())?;
        if active.is_empty() {
            return Err(Error::Config(format!("no active slices to store {}", instance)));
        }

        let info = if meta.replicated {
            let policy = self.replication.name();
            let returned = self
                .replication
                .replicate(instance, active, ctx)
                .map_err(|e| policy_failed(policy, instance, e))?;
            SliceInfo::replicated(validate_subset(policy, &instance.to_string(), returned, active)?)
        } else {
            let policy = self.distribution.name();
            let returned = self
                .distribution
                .distribute(instance, active, ctx)
                .map_err(|e| policy_failed(policy, instance, e))?;
            if !active.contains(&returned) {
                return Err(Error::PolicyViolation {
                    policy: policy.to_string(),
                    instance: instance.to_string(),
                    returned: vec![returned],
                    active: active.to_vec(),
                });
            }
            SliceInfo::single(returned)
        };
        debug!(instance = %instance, targets = ?info.targets, "Routed instance");
        Ok(info)
    }

    /// Choose the slices a query on `candidate` runs on.
    ///
    /// Replicas are identical, so a replicated candidate is read from the
    /// first active slice only.
    pub fn query_targets(
        &self,
        query: &str,
        args: &Args,
        candidate: &str,
        active: &[String],
        ctx: &RoutingContext,
    ) -> Result<Vec<String>> {
        if active.is_empty() {
            return Err(Error::Config(format!("no active slices to run {}", query)));
        }
        if self.metadata.is_replicated(candidate) {
            return Ok(vec![active[0].clone()]);
        }
        let policy = self.query_target.name();
        let returned = self
            .query_target
            .targets(query, args, active, ctx)
            .map_err(|e| Error::PolicyFailed {
                policy: policy.to_string(),
                instance: query.to_string(),
                source: Box::new(e),
            })?;
        validate_subset(policy, query, returned, active)
    }

    pub fn distribution_policy(&self) -> &str {
        self.distribution.name()
    }

    pub fn replication_policy(&self) -> &str {
        self.replication.name()
    }

    pub fn query_target_policy(&self) -> &str {
        self.query_target.name()
    }
}

fn policy_failed(policy: &str, instance: &Entity, source: Error) -> Error {
    Error::PolicyFailed {
        policy: policy.to_string(),
        instance: instance.to_string(),
        source: Box::new(source),
    }
}

/// Non-empty, every name active; duplicates dropped keeping first occurrence
fn validate_subset(policy: &str, subject: &str, returned: Vec<String>, active: &[String]) -> Result<Vec<String>> {
    if returned.is_empty() || returned.iter().any(|r| !active.contains(r)) {
        return Err(Error::PolicyViolation {
            policy: policy.to_string(),
            instance: subject.to_string(),
            returned,
            active: active.to_vec(),
        });
    }
    let mut targets: Vec<String> = Vec::with_capacity(returned.len());
    for name in returned {
        if !targets.contains(&name) {
            targets.push(name);
        }
    }
    Ok(targets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::fixtures::sample_repository;
    use crate::slice::policy::{QueryAll, ReplicateAll, RoundRobinDistribution};
    use assert_matches::assert_matches;

    struct Fixed(&'static str);

    impl DistributionPolicy for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }
        fn distribute(&self, _: &Entity, _: &[String], _: &RoutingContext) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Listed(Vec<&'static str>);

    impl ReplicationPolicy for Listed {
        fn name(&self) -> &str {
            "listed"
        }
        fn replicate(&self, _: &Entity, _: &[String], _: &RoutingContext) -> Result<Vec<String>> {
            Ok(self.0.iter().map(|s| s.to_string()).collect())
        }
    }

    struct Failing;

    impl DistributionPolicy for Failing {
        fn name(&self) -> &str {
            "failing"
        }
        fn distribute(&self, _: &Entity, _: &[String], _: &RoutingContext) -> Result<String> {
            Err(Error::Internal("lookup service down".to_string()))
        }
    }

    fn router(d: Arc<dyn DistributionPolicy>, r: Arc<dyn ReplicationPolicy>) -> DistributionRouter {
        DistributionRouter::new(Arc::new(sample_repository()), d, r, Arc::new(QueryAll))
    }

    fn active() -> Vec<String> {
        vec!["east".to_string(), "west".to_string()]
    }

    #[test]
    fn test_distribution_returns_single_target() {
        let router = router(Arc::new(RoundRobinDistribution::default()), Arc::new(ReplicateAll));
        let info = router
            .route(&Entity::new("Person"), &active(), &RoutingContext::default())
            .unwrap();
        assert!(!info.is_replicated());
        assert_eq!(info.targets(), ["east"]);
    }

    #[test]
    fn test_replicated_type_uses_replication_policy() {
        let router = router(Arc::new(Fixed("east")), Arc::new(Listed(vec!["west", "east", "west"])));
        let info = router
            .route(&Entity::new("Country"), &active(), &RoutingContext::default())
            .unwrap();
        assert!(info.is_replicated());
        assert_eq!(info.targets(), ["west", "east"]);
    }

    #[test]
    fn test_unknown_slice_is_policy_violation() {
        let router = router(Arc::new(Fixed("nowhere")), Arc::new(ReplicateAll));
        let err = router
            .route(&Entity::new("Person"), &active(), &RoutingContext::default())
            .unwrap_err();
        assert_matches!(
            err,
            Error::PolicyViolation { policy, returned, active, .. }
                if policy == "fixed" && returned == vec!["nowhere"] && active.len() == 2
        );
    }

    #[test]
    fn test_empty_replication_is_policy_violation() {
        let router = router(Arc::new(Fixed("east")), Arc::new(Listed(vec![])));
        assert_matches!(
            router.route(&Entity::new("Country"), &active(), &RoutingContext::default()),
            Err(Error::PolicyViolation { policy, .. }) if policy == "listed"
        );
    }

    #[test]
    fn test_policy_error_is_wrapped() {
        let router = router(Arc::new(Failing), Arc::new(ReplicateAll));
        assert_matches!(
            router.route(&Entity::new("Person"), &active(), &RoutingContext::default()),
            Err(Error::PolicyFailed { policy, .. }) if policy == "failing"
        );
    }

    #[test]
    fn test_query_targets() {
        let router = router(Arc::new(Fixed("east")), Arc::new(ReplicateAll));
        let ctx = RoutingContext::default();
        let all = router
            .query_targets("q", &Args::new(), "Person", &active(), &ctx)
            .unwrap();
        assert_eq!(all, active());
        let one = router
            .query_targets("q", &Args::new(), "Country", &active(), &ctx)
            .unwrap();
        assert_eq!(one, vec!["east"]);
        assert!(router
            .query_targets("q", &Args::new(), "Person", &[], &ctx)
            .is_err());
    }
}
