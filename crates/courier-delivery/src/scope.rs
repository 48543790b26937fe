//! Route matching against the tenant hierarchy.
//!
//! Resolution is split in two: storage resolves a tenant to its ancestor
//! chain, and [`route_matches`] is a pure predicate over that chain and the
//! route's scope. Nothing here knows how the hierarchy is stored.

use courier_core::models::{Direction, Route, TenantId};

/// A tenant and its ancestors, nearest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantChain {
    chain: Vec<TenantId>,
}

impl TenantChain {
    /// Builds a chain from storage order. The tenant itself is always first,
    /// even if storage omitted it.
    pub fn new(tenant_id: TenantId, ancestors: Vec<TenantId>) -> Self {
        let mut chain = Vec::with_capacity(ancestors.len() + 1);
        chain.push(tenant_id);
        chain.extend(ancestors.into_iter().filter(|ancestor| *ancestor != tenant_id));
        Self { chain }
    }

    /// The tenant the event belongs to.
    pub fn tenant(&self) -> TenantId {
        self.chain[0]
    }

    /// Strict ancestors, nearest first.
    pub fn ancestors(&self) -> &[TenantId] {
        &self.chain[1..]
    }

    /// Returns true if `tenant_id` is the tenant or one of its ancestors.
    pub fn contains(&self, tenant_id: TenantId) -> bool {
        self.chain.contains(&tenant_id)
    }
}

/// Returns true if `route` should deliver an event of `event_type` raised by
/// the tenant at the head of `chain`.
///
/// Exclusions win over everything: an excluded tenant excludes its whole
/// subtree. Otherwise a route serves its owner, the owner's descendants when
/// `include_children` is set, and every explicitly included tenant together
/// with that tenant's descendants when `include_children` is set.
pub fn route_matches(route: &Route, chain: &TenantChain, event_type: &str, direction: Direction) -> bool {
    if route.direction != direction || !route.handles_event_type(event_type) {
        return false;
    }

    let scope = &route.scope;
    if scope.excluded_tenants.iter().any(|excluded| chain.contains(*excluded)) {
        return false;
    }

    let tenant = chain.tenant();
    if route.tenant_id == tenant || scope.included_tenants.contains(&tenant) {
        return true;
    }

    if !scope.include_children {
        return false;
    }

    chain
        .ancestors()
        .iter()
        .any(|ancestor| *ancestor == route.tenant_id || scope.included_tenants.contains(ancestor))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use courier_core::models::{
        AuthConfig, RetrySettings, RouteId, Target, TenantScope,
    };

    use super::*;

    fn route(owner: TenantId, scope: TenantScope) -> Route {
        Route {
            id: RouteId::new(),
            tenant_id: owner,
            name: "orders".to_string(),
            direction: Direction::Push,
            event_types: vec!["order.created".to_string()],
            scope,
            target: Target::post("https://example.com"),
            auth: AuthConfig::None,
            retry: RetrySettings::default(),
            rate_limit: None,
            steps: Vec::new(),
            step_delay_ms: 0,
            schedule: None,
            data_source: None,
            active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    struct Tree {
        root: TenantId,
        child: TenantId,
        grandchild: TenantId,
    }

    impl Tree {
        fn new() -> Self {
            Self { root: TenantId::new(), child: TenantId::new(), grandchild: TenantId::new() }
        }

        fn chain_of(&self, tenant: TenantId) -> TenantChain {
            if tenant == self.grandchild {
                TenantChain::new(tenant, vec![self.child, self.root])
            } else if tenant == self.child {
                TenantChain::new(tenant, vec![self.root])
            } else {
                TenantChain::new(tenant, Vec::new())
            }
        }
    }

    #[test]
    fn owner_only_by_default() {
        let tree = Tree::new();
        let route = route(tree.root, TenantScope::default());

        assert!(route_matches(&route, &tree.chain_of(tree.root), "order.created", Direction::Push));
        assert!(!route_matches(&route, &tree.chain_of(tree.child), "order.created", Direction::Push));
    }

    #[test]
    fn include_children_reaches_whole_subtree() {
        let tree = Tree::new();
        let route = route(tree.root, TenantScope { include_children: true, ..Default::default() });

        assert!(route_matches(&route, &tree.chain_of(tree.grandchild), "order.created", Direction::Push));
    }

    #[test]
    fn exclusion_removes_subtree() {
        let tree = Tree::new();
        let route = route(
            tree.root,
            TenantScope {
                include_children: true,
                excluded_tenants: vec![tree.child],
                ..Default::default()
            },
        );

        assert!(route_matches(&route, &tree.chain_of(tree.root), "order.created", Direction::Push));
        assert!(!route_matches(&route, &tree.chain_of(tree.child), "order.created", Direction::Push));
        assert!(!route_matches(&route, &tree.chain_of(tree.grandchild), "order.created", Direction::Push));
    }

    #[test]
    fn explicit_inclusion_without_children() {
        let tree = Tree::new();
        let other = TenantId::new();
        let route = route(other, TenantScope { included_tenants: vec![tree.child], ..Default::default() });

        assert!(route_matches(&route, &tree.chain_of(tree.child), "order.created", Direction::Push));
        assert!(!route_matches(&route, &tree.chain_of(tree.grandchild), "order.created", Direction::Push));
    }

    #[test]
    fn event_type_and_direction_must_match() {
        let tree = Tree::new();
        let route = route(tree.root, TenantScope::default());
        let chain = tree.chain_of(tree.root);

        assert!(!route_matches(&route, &chain, "order.deleted", Direction::Push));
        assert!(!route_matches(&route, &chain, "order.created", Direction::Scheduled));
    }

    #[test]
    fn chain_always_starts_with_tenant() {
        let tenant = TenantId::new();
        let parent = TenantId::new();

        let chain = TenantChain::new(tenant, vec![tenant, parent]);

        assert_eq!(chain.tenant(), tenant);
        assert_eq!(chain.ancestors(), &[parent]);
    }
}
