//! Role table for protected routes.

use std::collections::{HashMap, HashSet};

use crate::config::{RouteTable, route_key};
use crate::error::AuthError;
use crate::store::Role;

/// Map from `"METHOD /template"` to the roles allowed through. Read-only once built.
#[derive(Debug, Clone, Default)]
pub struct RouteAuthorization {
    permitted: HashMap<String, HashSet<Role>>,
}

impl RouteAuthorization {
    /// Protected entries of `table`. Public entries are left out, so the
    /// gate rejects them like any unknown route.
    pub fn from_table(table: &RouteTable) -> Self {
        let mut permitted: HashMap<String, HashSet<Role>> = HashMap::new();
        for rule in table.routes.iter().filter(|r| !r.is_public()) {
            permitted
                .entry(rule.key())
                .or_default()
                .extend(rule.allowed_roles.iter().copied());
        }
        Self { permitted }
    }

    pub fn is_protected(&self, method: &str, route: &str) -> bool {
        self.permitted.contains_key(&route_key(method, route))
    }

    /// Check `role` against the route. Unknown routes are unauthorized.
    pub fn authorize(&self, method: &str, route: &str, role: Role) -> Result<(), AuthError> {
        let roles = self
            .permitted
            .get(&route_key(method, route))
            .ok_or(AuthError::Unauthorized("route not permitted"))?;
        if roles.contains(&role) {
            Ok(())
        } else {
            Err(AuthError::Forbidden)
        }
    }

    pub fn len(&self) -> usize {
        self.permitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.permitted.is_empty()
    }
}
