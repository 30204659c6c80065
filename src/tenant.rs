//! Tenant configuration consumed by the queue.
//!
//! The queue never owns tenant settings. It asks a `TenantConfig` at enqueue,
//! lease and normalization time; the answers may be stale because the refill
//! and lease scripts re-check limits against the store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::item::{ConcurrencyScope, CustomConcurrencyKey, QueueItem, Throttle, short_hash};
use crate::partition::{
    CustomConcurrencyLimit, PartitionConstraints, ShadowPartitionConcurrency,
    ShadowPartitionThrottle,
};
use crate::settings::TenantSettings;

#[async_trait]
pub trait TenantConfig: Send + Sync {
    /// Route the account's items through backlogs instead of straight into ready queues.
    async fn allow_key_queues(&self, account_id: Uuid) -> bool;

    /// Skip active-set checks when leasing the account's items.
    async fn disable_lease_checks(&self, account_id: Uuid) -> bool;

    /// Current limits for a partition.
    async fn partition_constraints(
        &self,
        account_id: Option<Uuid>,
        partition_id: &str,
    ) -> PartitionConstraints;

    /// Re-evaluate an item's custom concurrency keys and throttle against
    /// the latest function configuration.
    async fn refresh_item_constraints(&self, item: &mut QueueItem);

    /// Guaranteed capacity as `(priority, minimum workers)`, if the account has any.
    async fn guaranteed_capacity(&self, _account_id: Uuid) -> Option<(u32, u32)> {
        None
    }
}

/// Custom concurrency key defined on a function.
///
/// `expression` is a JSON pointer into the item payload, e.g. `/customerId`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomKeySpec {
    pub scope: ConcurrencyScope,
    pub expression: String,
    pub limit: i64,
}

impl CustomKeySpec {
    pub fn expression_hash(&self) -> String {
        short_hash(&self.expression)
    }
}

/// Throttle defined on a function. Without an expression the whole function
/// shares one bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleSpec {
    pub expression: Option<String>,
    pub limit: i64,
    pub burst: i64,
    pub period_secs: i64,
}

impl ThrottleSpec {
    fn expression_hash(&self) -> String {
        short_hash(self.expression.as_deref().unwrap_or(""))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSettings {
    pub key_queues: bool,
    pub disable_lease_checks: bool,
    pub account_concurrency: i64,
    /// Minimum workers reserved for the account; zero disables it.
    pub guaranteed_workers: u32,
    pub guaranteed_priority: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionSettings {
    pub version: i32,
    pub concurrency: i64,
    pub custom_keys: Vec<CustomKeySpec>,
    pub throttle: Option<ThrottleSpec>,
}

#[derive(Default)]
struct TenantState {
    accounts: HashMap<Uuid, AccountSettings>,
    functions: HashMap<Uuid, FunctionSettings>,
    system_concurrency: i64,
}

/// In-memory tenant configuration. Settings can be changed at runtime.
#[derive(Default)]
pub struct StaticTenantConfig {
    state: RwLock<TenantState>,
}

impl StaticTenantConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(tenants: &[TenantSettings]) -> Self {
        let cfg = Self::new();
        for t in tenants {
            cfg.set_account(
                t.account_id,
                AccountSettings {
                    key_queues: t.key_queues,
                    disable_lease_checks: t.disable_lease_checks,
                    account_concurrency: t.account_concurrency,
                    guaranteed_workers: t.guaranteed_workers,
                    guaranteed_priority: t.guaranteed_priority,
                },
            );
        }
        cfg
    }

    pub fn set_account(&self, account_id: Uuid, settings: AccountSettings) {
        self.state.write().accounts.insert(account_id, settings);
    }

    pub fn set_function(&self, function_id: Uuid, settings: FunctionSettings) {
        self.state.write().functions.insert(function_id, settings);
    }

    pub fn set_system_concurrency(&self, limit: i64) {
        self.state.write().system_concurrency = limit;
    }

    /// Stamp the item's custom keys and throttle from its function's settings.
    pub fn evaluate(&self, item: &mut QueueItem) {
        let state = self.state.read();
        let Some(function) = state.functions.get(&item.function_id) else {
            item.data.custom_concurrency_keys.clear();
            item.data.throttle = None;
            return;
        };

        item.data.custom_concurrency_keys = function
            .custom_keys
            .iter()
            .take(2)
            .map(|spec| {
                let value = evaluate_expression(&item.data.payload, &spec.expression);
                let entity_id = match spec.scope {
                    ConcurrencyScope::Fn => item.function_id,
                    ConcurrencyScope::Env => item.workspace_id,
                    ConcurrencyScope::Account => item.account_id(),
                };
                CustomConcurrencyKey {
                    scope: spec.scope,
                    entity_id,
                    key_expression_hash: spec.expression_hash(),
                    value_hash: short_hash(&value),
                    unhashed_value: value,
                    limit: spec.limit,
                }
            })
            .collect();

        item.data.throttle = function.throttle.as_ref().map(|spec| {
            let raw = match &spec.expression {
                Some(expr) => evaluate_expression(&item.data.payload, expr),
                None => item.function_id.to_string(),
            };
            Throttle {
                key: short_hash(&format!("{}:{}", item.function_id, raw)),
                key_expression_hash: spec.expression_hash(),
                limit: spec.limit,
                burst: spec.burst,
                period_secs: spec.period_secs,
            }
        });
    }
}

fn evaluate_expression(payload: &serde_json::Value, expression: &str) -> String {
    match payload.pointer(expression) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait]
impl TenantConfig for StaticTenantConfig {
    async fn allow_key_queues(&self, account_id: Uuid) -> bool {
        self.state
            .read()
            .accounts
            .get(&account_id)
            .map(|a| a.key_queues)
            .unwrap_or(false)
    }

    async fn disable_lease_checks(&self, account_id: Uuid) -> bool {
        self.state
            .read()
            .accounts
            .get(&account_id)
            .map(|a| a.disable_lease_checks)
            .unwrap_or(false)
    }

    async fn partition_constraints(
        &self,
        account_id: Option<Uuid>,
        partition_id: &str,
    ) -> PartitionConstraints {
        let state = self.state.read();
        let account_concurrency = account_id
            .and_then(|a| state.accounts.get(&a))
            .map(|a| a.account_concurrency)
            .unwrap_or(0);
        let function = Uuid::parse_str(partition_id)
            .ok()
            .and_then(|id| state.functions.get(&id));

        let Some(function) = function else {
            return PartitionConstraints {
                function_version: 0,
                concurrency: ShadowPartitionConcurrency {
                    system_concurrency: state.system_concurrency,
                    account_concurrency,
                    ..Default::default()
                },
                throttle: None,
            };
        };

        PartitionConstraints {
            function_version: function.version,
            concurrency: ShadowPartitionConcurrency {
                system_concurrency: state.system_concurrency,
                account_concurrency,
                function_concurrency: function.concurrency,
                custom_concurrency_keys: function
                    .custom_keys
                    .iter()
                    .take(2)
                    .map(|spec| CustomConcurrencyLimit {
                        scope: spec.scope,
                        key_expression_hash: spec.expression_hash(),
                        limit: spec.limit,
                    })
                    .collect(),
            },
            throttle: function.throttle.as_ref().map(|t| ShadowPartitionThrottle {
                key_expression_hash: t.expression_hash(),
                limit: t.limit,
                burst: t.burst,
                period_secs: t.period_secs,
            }),
        }
    }

    async fn refresh_item_constraints(&self, item: &mut QueueItem) {
        self.evaluate(item);
    }

    async fn guaranteed_capacity(&self, account_id: Uuid) -> Option<(u32, u32)> {
        self.state
            .read()
            .accounts
            .get(&account_id)
            .filter(|a| a.guaranteed_workers > 0)
            .map(|a| (a.guaranteed_priority, a.guaranteed_workers))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::{Identifier, ItemKind, Payload};
    use ulid::Ulid;

    fn item(function_id: Uuid) -> QueueItem {
        let mut payload = Payload::new(
            ItemKind::Edge,
            Identifier {
                run_id: Ulid::new(),
                function_id,
                function_version: 1,
                account_id: Uuid::new_v4(),
                env_id: Uuid::new_v4(),
                app_id: Uuid::new_v4(),
                idempotency_key: None,
            },
        );
        payload.payload = serde_json::json!({"customer": "c-1", "plan": "pro"});
        QueueItem::new(payload)
    }

    #[tokio::test]
    async fn evaluates_custom_keys_from_payload() {
        let cfg = StaticTenantConfig::new();
        let function_id = Uuid::new_v4();
        cfg.set_function(
            function_id,
            FunctionSettings {
                version: 1,
                concurrency: 5,
                custom_keys: vec![CustomKeySpec {
                    scope: ConcurrencyScope::Fn,
                    expression: "/customer".to_string(),
                    limit: 2,
                }],
                throttle: None,
            },
        );

        let mut it = item(function_id);
        cfg.refresh_item_constraints(&mut it).await;
        assert_eq!(it.data.custom_concurrency_keys.len(), 1);
        let key = &it.data.custom_concurrency_keys[0];
        assert_eq!(key.unhashed_value, "c-1");
        assert_eq!(key.limit, 2);

        let constraints = cfg
            .partition_constraints(Some(it.account_id()), &function_id.to_string())
            .await;
        assert_eq!(constraints.concurrency.function_concurrency, 5);
        assert_eq!(
            constraints.concurrency.custom_concurrency_keys[0].key_expression_hash,
            key.key_expression_hash
        );
    }

    #[tokio::test]
    async fn unknown_accounts_use_ready_queues() {
        let cfg = StaticTenantConfig::new();
        assert!(!cfg.allow_key_queues(Uuid::new_v4()).await);
        let account = Uuid::new_v4();
        cfg.set_account(
            account,
            AccountSettings {
                key_queues: true,
                ..Default::default()
            },
        );
        assert!(cfg.allow_key_queues(account).await);
    }
}
