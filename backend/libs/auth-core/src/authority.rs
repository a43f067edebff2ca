//! Authority derivation from verified token claims.
//!
//! An authority is a flat string matched by prefix: `SCOPE_orders.write`,
//! `TENANT_acme:BUYER`, `AUD_order-platform`, `PERM_refunds`. Guards
//! compare against values built through the same [`AuthzConfig`] so an
//! operator-changed prefix stays consistent end to end.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One granted authority.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Authority(String);

impl Authority {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Authority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Authorization mapping configuration (`SECURITY_AUTHZ_*` environment).
#[derive(Debug, Clone, Deserialize)]
pub struct AuthzConfig {
    /// Claim carrying the tenant → roles map
    #[serde(default = "default_tenant_claim")]
    pub tenant_claim: String,
    #[serde(default = "default_scope_prefix")]
    pub scope_authority_prefix: String,
    #[serde(default = "default_tenant_role_prefix")]
    pub tenant_role_authority_prefix: String,
    /// Keycloak `resource_access` keys with this prefix map to tenants
    #[serde(default = "default_keycloak_prefix")]
    pub keycloak_tenant_resource_prefix: String,
    #[serde(default)]
    pub map_audience_to_authorities: bool,
    #[serde(default = "default_audience_prefix")]
    pub audience_authority_prefix: String,
    #[serde(default = "default_permission_prefix")]
    pub permission_authority_prefix: String,
    /// Header that may narrow the tenant on a request
    #[serde(default = "default_tenant_header")]
    pub tenant_header: String,
}

impl Default for AuthzConfig {
    fn default() -> Self {
        Self {
            tenant_claim: default_tenant_claim(),
            scope_authority_prefix: default_scope_prefix(),
            tenant_role_authority_prefix: default_tenant_role_prefix(),
            keycloak_tenant_resource_prefix: default_keycloak_prefix(),
            map_audience_to_authorities: false,
            audience_authority_prefix: default_audience_prefix(),
            permission_authority_prefix: default_permission_prefix(),
            tenant_header: default_tenant_header(),
        }
    }
}

fn default_tenant_claim() -> String {
    "mt".to_string()
}

fn default_scope_prefix() -> String {
    "SCOPE_".to_string()
}

fn default_tenant_role_prefix() -> String {
    "TENANT_".to_string()
}

fn default_keycloak_prefix() -> String {
    "tenant-".to_string()
}

fn default_audience_prefix() -> String {
    "AUD_".to_string()
}

fn default_permission_prefix() -> String {
    "PERM_".to_string()
}

fn default_tenant_header() -> String {
    "X-Tenant-ID".to_string()
}

impl AuthzConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("SECURITY_AUTHZ_").from_env()
    }

    pub fn scope(&self, scope: &str) -> Authority {
        Authority(format!("{}{}", self.scope_authority_prefix, scope))
    }

    pub fn tenant_role(&self, tenant: &str, role: &str) -> Authority {
        Authority(format!(
            "{}{}:{}",
            self.tenant_role_authority_prefix, tenant, role
        ))
    }

    pub fn audience(&self, audience: &str) -> Authority {
        Authority(format!("{}{}", self.audience_authority_prefix, audience))
    }

    pub fn permission(&self, permission: &str) -> Authority {
        Authority(format!("{}{}", self.permission_authority_prefix, permission))
    }

    /// Tenant ids a set of authorities grants, in derivation order.
    pub fn tenants_of(&self, authorities: &[Authority]) -> Vec<String> {
        let mut tenants = Vec::new();
        for authority in authorities {
            if let Some(rest) = authority.0.strip_prefix(&self.tenant_role_authority_prefix) {
                if let Some((tenant, _role)) = rest.split_once(':') {
                    if !tenants.iter().any(|t| t == tenant) {
                        tenants.push(tenant.to_string());
                    }
                }
            }
        }
        tenants
    }

    /// Derive the full authority set from verified claims.
    pub fn authorities_from_claims(&self, claims: &Map<String, Value>) -> Vec<Authority> {
        let mut authorities = Vec::new();
        let mut push = |authority: Authority| {
            if !authorities.contains(&authority) {
                authorities.push(authority);
            }
        };

        // 1. scope / scp, split on whitespace and commas.
        let scope_value = claims.get("scope").or_else(|| claims.get("scp"));
        for scope in scope_tokens(scope_value) {
            push(self.scope(&scope));
        }

        // 2. Tenant-roles claim: { "<tenant>": ["ROLE", ...] }.
        if let Some(Value::Object(tenants)) = claims.get(&self.tenant_claim) {
            for (tenant, roles) in tenants {
                for role in role_tokens(roles) {
                    push(self.tenant_role(tenant, &role));
                }
            }
        }

        // 3. Keycloak resource_access with the configured client prefix.
        if let Some(Value::Object(resources)) = claims.get("resource_access") {
            for (client, access) in resources {
                if let Some(tenant) = client.strip_prefix(&self.keycloak_tenant_resource_prefix) {
                    if let Some(roles) = access.get("roles") {
                        for role in role_tokens(roles) {
                            push(self.tenant_role(tenant, &role));
                        }
                    }
                }
            }
        }

        // 4. Optional audience mapping.
        if self.map_audience_to_authorities {
            match claims.get("aud") {
                Some(Value::String(aud)) => push(self.audience(aud)),
                Some(Value::Array(auds)) => {
                    for aud in auds.iter().filter_map(Value::as_str) {
                        push(self.audience(aud));
                    }
                }
                _ => {}
            }
        }

        // 5. Optional permissions array.
        if let Some(Value::Array(perms)) = claims.get("perm") {
            for perm in perms.iter().filter_map(Value::as_str) {
                push(self.permission(perm));
            }
        }

        authorities
    }
}

fn scope_tokens(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => s
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty())
            .map(String::from)
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

fn role_tokens(value: &Value) -> Vec<String> {
    match value {
        Value::String(role) => vec![role.clone()],
        Value::Array(roles) => roles
            .iter()
            .filter_map(Value::as_str)
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn claims(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn scopes_split_on_whitespace_and_commas() {
        let config = AuthzConfig::default();
        let authorities = config.authorities_from_claims(&claims(json!({
            "scope": "orders.read orders.write,profile"
        })));

        assert_eq!(
            authorities,
            vec![
                Authority::new("SCOPE_orders.read"),
                Authority::new("SCOPE_orders.write"),
                Authority::new("SCOPE_profile"),
            ]
        );
    }

    #[test]
    fn scp_is_the_fallback_claim() {
        let config = AuthzConfig::default();
        let authorities =
            config.authorities_from_claims(&claims(json!({"scp": ["orders.read", "orders.write"]})));
        assert!(authorities.contains(&Authority::new("SCOPE_orders.read")));
        assert!(authorities.contains(&Authority::new("SCOPE_orders.write")));
    }

    #[test]
    fn tenant_roles_map_to_tenant_authorities() {
        let config = AuthzConfig::default();
        let authorities = config.authorities_from_claims(&claims(json!({
            "mt": {
                "acme": ["BUYER", "ADMIN"],
                "globex": "BUYER"
            }
        })));

        assert!(authorities.contains(&Authority::new("TENANT_acme:BUYER")));
        assert!(authorities.contains(&Authority::new("TENANT_acme:ADMIN")));
        assert!(authorities.contains(&Authority::new("TENANT_globex:BUYER")));
    }

    #[test]
    fn keycloak_resource_access_contributes_tenants() {
        let config = AuthzConfig::default();
        let authorities = config.authorities_from_claims(&claims(json!({
            "resource_access": {
                "tenant-acme": {"roles": ["BUYER"]},
                "account": {"roles": ["manage-account"]}
            }
        })));

        assert_eq!(authorities, vec![Authority::new("TENANT_acme:BUYER")]);
    }

    #[test]
    fn audience_mapping_is_opt_in() {
        let mut config = AuthzConfig::default();
        let token_claims = claims(json!({"aud": "order-platform"}));

        assert!(config.authorities_from_claims(&token_claims).is_empty());

        config.map_audience_to_authorities = true;
        assert_eq!(
            config.authorities_from_claims(&token_claims),
            vec![Authority::new("AUD_order-platform")]
        );
    }

    #[test]
    fn permissions_map_with_their_prefix() {
        let config = AuthzConfig::default();
        let authorities =
            config.authorities_from_claims(&claims(json!({"perm": ["refunds", "exports"]})));
        assert_eq!(
            authorities,
            vec![Authority::new("PERM_refunds"), Authority::new("PERM_exports")]
        );
    }

    #[test]
    fn duplicates_collapse() {
        let config = AuthzConfig::default();
        let authorities = config.authorities_from_claims(&claims(json!({
            "scope": "orders.read orders.read",
            "mt": {"acme": ["BUYER"]},
            "resource_access": {"tenant-acme": {"roles": ["BUYER"]}}
        })));

        assert_eq!(
            authorities,
            vec![
                Authority::new("SCOPE_orders.read"),
                Authority::new("TENANT_acme:BUYER"),
            ]
        );
    }

    #[test]
    fn tenants_of_extracts_in_order() {
        let config = AuthzConfig::default();
        let authorities = vec![
            Authority::new("SCOPE_orders.write"),
            Authority::new("TENANT_acme:BUYER"),
            Authority::new("TENANT_globex:ADMIN"),
            Authority::new("TENANT_acme:ADMIN"),
        ];
        assert_eq!(config.tenants_of(&authorities), vec!["acme", "globex"]);
    }
}
