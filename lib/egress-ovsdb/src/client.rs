//! `NbClient` over the OVN_Northbound database
//!
//! Table mapping:
//! - port groups: `Port_Group`, members are `Logical_Switch_Port` references
//!   resolved from and to port names
//! - address sets: `Address_Set`
//! - liveness sessions: `BFD`
//! - router policies: `Logical_Router_Policy`, reachable only through
//!   `Logical_Router.policies`; creation and deletion mutate the router row
//!   in the same transaction

use crate::rpc::RpcClient;
use crate::value::{
    column, decode_i64, decode_map, decode_optional_i64, decode_string, decode_strings, decode_uuid, eq,
    includes, map, named_uuid, string_set, uuid, uuid_set,
};
use crate::{OvsdbError, Result};
use async_trait::async_trait;
use egress_core::{
    AddressSet, BfdParams, BfdSession, CoreError, ExternalIds, NbClient, PolicyAction, PortGroup, RouterPolicy,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const NB_DATABASE: &str = "OVN_Northbound";

const PORT_GROUP_COLUMNS: [&str; 4] = ["_uuid", "name", "ports", "external_ids"];
const ADDRESS_SET_COLUMNS: [&str; 4] = ["_uuid", "name", "addresses", "external_ids"];
const BFD_COLUMNS: [&str; 7] = ["_uuid", "logical_port", "dst_ip", "min_tx", "min_rx", "detect_mult", "external_ids"];
const POLICY_COLUMNS: [&str; 7] = ["_uuid", "priority", "match", "action", "nexthops", "bfd_sessions", "external_ids"];

/// Northbound client; reconnects on the next call once the session dropped
pub struct OvsdbNbClient {
    address: Option<String>,
    timeout: Duration,
    session: Mutex<Option<Arc<RpcClient>>>,
}

impl OvsdbNbClient {
    pub async fn connect(address: &str, timeout: Duration) -> Result<Self> {
        let rpc = RpcClient::connect(address, timeout).await?;
        Ok(Self {
            address: Some(address.to_string()),
            timeout,
            session: Mutex::new(Some(Arc::new(rpc))),
        })
    }

    /// Use an established session; no reconnection once it is closed
    pub fn with_rpc(rpc: RpcClient) -> Self {
        Self {
            address: None,
            timeout: Duration::ZERO,
            session: Mutex::new(Some(Arc::new(rpc))),
        }
    }

    async fn session(&self) -> Result<Arc<RpcClient>> {
        let current = self.session.lock().clone();
        if let Some(rpc) = current.filter(|rpc| !rpc.is_closed()) {
            return Ok(rpc);
        }
        let Some(address) = &self.address else {
            return Err(OvsdbError::Disconnected);
        };
        let rpc = Arc::new(RpcClient::connect(address, self.timeout).await?);
        *self.session.lock() = Some(rpc.clone());
        Ok(rpc)
    }

    /// Run `operations` as one transaction, failing on the first rejected one
    pub async fn transact(&self, operations: Vec<Value>) -> Result<Vec<Value>> {
        let mut params = vec![Value::from(NB_DATABASE)];
        params.extend(operations);

        let reply = self.session().await?.call("transact", Value::Array(params)).await?;
        let Value::Array(results) = reply else {
            return Err(OvsdbError::Decode(format!("transact returned {}", reply)));
        };
        for (index, result) in results.iter().enumerate() {
            if let Some(error) = result.get("error").and_then(Value::as_str) {
                return Err(OvsdbError::Transaction {
                    index,
                    error: error.to_string(),
                    details: result.get("details").and_then(Value::as_str).map(str::to_string),
                });
            }
        }
        Ok(results)
    }

    async fn select(&self, table: &str, conditions: Vec<Value>, columns: &[&str]) -> Result<Vec<Value>> {
        let results = self.transact(vec![select_op(table, conditions, columns)]).await?;
        rows(results.first())
    }

    /// Names of the given logical switch ports, by uuid; unknown ones are absent
    async fn port_names(&self, uuids: &BTreeSet<String>) -> Result<BTreeMap<String, String>> {
        if uuids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let operations = uuids
            .iter()
            .map(|id| select_op("Logical_Switch_Port", vec![eq("_uuid", uuid(id))], &["_uuid", "name"]))
            .collect();
        let mut names = BTreeMap::new();
        for result in self.transact(operations).await? {
            for row in rows(Some(&result))? {
                names.insert(decode_uuid(column(&row, "_uuid")?)?, decode_string(column(&row, "name")?)?);
            }
        }
        Ok(names)
    }

    /// Uuids of the named logical switch ports, all of which must exist
    async fn port_uuids(&self, names: &[String]) -> Result<Vec<String>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let operations = names
            .iter()
            .map(|name| select_op("Logical_Switch_Port", vec![eq("name", Value::from(name.as_str()))], &["_uuid"]))
            .collect();
        let results = self.transact(operations).await?;
        let mut uuids = Vec::with_capacity(names.len());
        for (name, result) in names.iter().zip(results.iter()) {
            let found = rows(Some(result))?;
            let row = found
                .first()
                .ok_or_else(|| OvsdbError::NotFound(format!("logical switch port {}", name)))?;
            uuids.push(decode_uuid(column(row, "_uuid")?)?);
        }
        Ok(uuids)
    }

    async fn port_groups(&self, conditions: Vec<Value>) -> Result<Vec<PortGroup>> {
        let found = self.select("Port_Group", conditions, &PORT_GROUP_COLUMNS).await?;
        let mut groups = Vec::with_capacity(found.len());
        let mut members = BTreeSet::new();
        for row in &found {
            let ports = decode_strings(column(row, "ports")?)?;
            members.extend(ports.iter().cloned());
            groups.push(PortGroup {
                uuid: decode_uuid(column(row, "_uuid")?)?,
                name: decode_string(column(row, "name")?)?,
                ports,
                external_ids: decode_map(column(row, "external_ids")?)?,
            });
        }

        let names = self.port_names(&members).await?;
        for group in &mut groups {
            group.ports = group.ports.iter().filter_map(|id| names.get(id).cloned()).collect();
            group.ports.sort();
        }
        Ok(groups)
    }

    async fn address_sets(&self, conditions: Vec<Value>) -> Result<Vec<AddressSet>> {
        self.select("Address_Set", conditions, &ADDRESS_SET_COLUMNS)
            .await?
            .iter()
            .map(|row| -> Result<AddressSet> {
                Ok(AddressSet {
                    uuid: decode_uuid(column(row, "_uuid")?)?,
                    name: decode_string(column(row, "name")?)?,
                    addresses: decode_strings(column(row, "addresses")?)?,
                    external_ids: decode_map(column(row, "external_ids")?)?,
                })
            })
            .collect()
    }

    async fn insert(&self, table: &str, row: Value) -> Result<String> {
        let results = self
            .transact(vec![json!({"op": "insert", "table": table, "row": row})])
            .await?;
        inserted_uuid(results.first())
    }

    async fn update(&self, table: &str, conditions: Vec<Value>, row: Value, object: &str) -> Result<()> {
        let results = self
            .transact(vec![json!({"op": "update", "table": table, "where": conditions, "row": row})])
            .await?;
        expect_count(results.first(), object)
    }

    async fn delete(&self, table: &str, conditions: Vec<Value>) -> Result<()> {
        self.transact(vec![json!({"op": "delete", "table": table, "where": conditions})])
            .await?;
        Ok(())
    }

    async fn policies(&self, router: &str, priority: Option<i64>, tag: &ExternalIds) -> Result<Vec<RouterPolicy>> {
        let mut conditions = vec![includes("external_ids", tag)];
        if let Some(priority) = priority {
            conditions.push(eq("priority", Value::from(priority)));
        }
        let results = self
            .transact(vec![
                select_op("Logical_Router", vec![eq("name", Value::from(router))], &["policies"]),
                select_op("Logical_Router_Policy", conditions, &POLICY_COLUMNS),
            ])
            .await?;

        let routers = rows(results.first())?;
        let Some(router_row) = routers.first() else {
            debug!("Logical router {} not found, no policies attached", router);
            return Ok(Vec::new());
        };
        let attached: BTreeSet<String> = decode_strings(column(router_row, "policies")?)?.into_iter().collect();

        let mut policies = Vec::new();
        for row in rows(results.get(1))? {
            let policy = policy_from_row(&row)?;
            if attached.contains(&policy.uuid) {
                policies.push(policy);
            }
        }
        Ok(policies)
    }

    async fn add_policy(&self, router: &str, policy: &RouterPolicy) -> Result<String> {
        let row = json!({
            "priority": policy.priority,
            "match": policy.match_expr,
            "action": policy.action.as_str(),
            "nexthops": string_set(policy.next_hops.as_slice()),
            "bfd_sessions": uuid_set(policy.bfd_sessions.as_slice()),
            "external_ids": map(&policy.external_ids),
        });
        let results = self
            .transact(vec![
                json!({"op": "insert", "table": "Logical_Router_Policy", "row": row, "uuid-name": "new_policy"}),
                json!({
                    "op": "mutate",
                    "table": "Logical_Router",
                    "where": [eq("name", Value::from(router))],
                    "mutations": [["policies", "insert", ["set", [named_uuid("new_policy")]]]],
                }),
            ])
            .await?;
        // an unattached policy row is garbage collected with the transaction
        expect_count(results.get(1), &format!("logical router {}", router))?;
        inserted_uuid(results.first())
    }

    async fn remove_policy(&self, router: &str, id: &str) -> Result<()> {
        self.transact(vec![json!({
            "op": "mutate",
            "table": "Logical_Router",
            "where": [eq("name", Value::from(router))],
            "mutations": [["policies", "delete", uuid_set(&[id])]],
        })])
        .await?;
        Ok(())
    }
}

fn select_op(table: &str, conditions: Vec<Value>, columns: &[&str]) -> Value {
    json!({"op": "select", "table": table, "where": conditions, "columns": columns})
}

fn rows(result: Option<&Value>) -> Result<Vec<Value>> {
    match result.and_then(|r| r.get("rows")) {
        Some(Value::Array(rows)) => Ok(rows.clone()),
        _ => Err(OvsdbError::Decode("select returned no rows".to_string())),
    }
}

fn inserted_uuid(result: Option<&Value>) -> Result<String> {
    match result.and_then(|r| r.get("uuid")) {
        Some(id) => decode_uuid(id),
        None => Err(OvsdbError::Decode("insert returned no uuid".to_string())),
    }
}

fn expect_count(result: Option<&Value>, object: &str) -> Result<()> {
    match result.and_then(|r| r.get("count")).and_then(Value::as_u64) {
        Some(0) => Err(OvsdbError::NotFound(object.to_string())),
        Some(_) => Ok(()),
        None => Err(OvsdbError::Decode("reply carries no row count".to_string())),
    }
}

fn bfd_from_row(row: &Value) -> Result<BfdSession> {
    let defaults = BfdParams::default();
    Ok(BfdSession {
        uuid: decode_uuid(column(row, "_uuid")?)?,
        logical_port: decode_string(column(row, "logical_port")?)?,
        dst_ip: decode_string(column(row, "dst_ip")?)?,
        params: BfdParams {
            min_tx: decode_optional_i64(column(row, "min_tx")?)?.unwrap_or(defaults.min_tx),
            min_rx: decode_optional_i64(column(row, "min_rx")?)?.unwrap_or(defaults.min_rx),
            detect_mult: decode_optional_i64(column(row, "detect_mult")?)?.unwrap_or(defaults.detect_mult),
        },
        external_ids: decode_map(column(row, "external_ids")?)?,
    })
}

fn policy_from_row(row: &Value) -> Result<RouterPolicy> {
    let action = decode_string(column(row, "action")?)?;
    Ok(RouterPolicy {
        uuid: decode_uuid(column(row, "_uuid")?)?,
        priority: decode_i64(column(row, "priority")?)?,
        match_expr: decode_string(column(row, "match")?)?,
        action: PolicyAction::parse(&action)
            .ok_or_else(|| OvsdbError::Decode(format!("unknown policy action {}", action)))?,
        next_hops: decode_strings(column(row, "nexthops")?)?,
        bfd_sessions: decode_strings(column(row, "bfd_sessions")?)?,
        external_ids: decode_map(column(row, "external_ids")?)?,
    })
}

fn bfd_params_row(params: &BfdParams) -> Value {
    json!({
        "min_tx": params.min_tx,
        "min_rx": params.min_rx,
        "detect_mult": params.detect_mult,
    })
}

trait NorthboundResult<T> {
    fn nb(self, op: &'static str, object: &str) -> egress_core::Result<T>;
}

impl<T> NorthboundResult<T> for Result<T> {
    fn nb(self, op: &'static str, object: &str) -> egress_core::Result<T> {
        self.map_err(|e| CoreError::northbound(op, object, e))
    }
}

#[async_trait]
impl NbClient for OvsdbNbClient {
    async fn get_port_group(&self, name: &str) -> egress_core::Result<Option<PortGroup>> {
        let groups = self
            .port_groups(vec![eq("name", Value::from(name))])
            .await
            .nb("get", name)?;
        Ok(groups.into_iter().next())
    }

    async fn list_port_groups(&self, tag: &ExternalIds) -> egress_core::Result<Vec<PortGroup>> {
        self.port_groups(vec![includes("external_ids", tag)])
            .await
            .nb("list", "port groups")
    }

    async fn create_port_group(&self, name: &str, external_ids: &ExternalIds) -> egress_core::Result<()> {
        self.insert("Port_Group", json!({"name": name, "external_ids": map(external_ids)}))
            .await
            .map(|_| ())
            .nb("create", name)
    }

    async fn set_port_group_ports(&self, name: &str, ports: &[String]) -> egress_core::Result<()> {
        let uuids = self.port_uuids(ports).await.nb("update", name)?;
        self.update(
            "Port_Group",
            vec![eq("name", Value::from(name))],
            json!({"ports": uuid_set(uuids.as_slice())}),
            name,
        )
        .await
        .nb("update", name)
    }

    async fn delete_port_group(&self, name: &str) -> egress_core::Result<()> {
        self.delete("Port_Group", vec![eq("name", Value::from(name))])
            .await
            .nb("delete", name)
    }

    async fn get_address_set(&self, name: &str) -> egress_core::Result<Option<AddressSet>> {
        let sets = self
            .address_sets(vec![eq("name", Value::from(name))])
            .await
            .nb("get", name)?;
        Ok(sets.into_iter().next())
    }

    async fn list_address_sets(&self, tag: &ExternalIds) -> egress_core::Result<Vec<AddressSet>> {
        self.address_sets(vec![includes("external_ids", tag)])
            .await
            .nb("list", "address sets")
    }

    async fn create_address_set(&self, name: &str, external_ids: &ExternalIds) -> egress_core::Result<()> {
        self.insert("Address_Set", json!({"name": name, "external_ids": map(external_ids)}))
            .await
            .map(|_| ())
            .nb("create", name)
    }

    async fn set_address_set_addresses(&self, name: &str, addresses: &[String]) -> egress_core::Result<()> {
        self.update(
            "Address_Set",
            vec![eq("name", Value::from(name))],
            json!({"addresses": string_set(addresses)}),
            name,
        )
        .await
        .nb("update", name)
    }

    async fn delete_address_set(&self, name: &str) -> egress_core::Result<()> {
        self.delete("Address_Set", vec![eq("name", Value::from(name))])
            .await
            .nb("delete", name)
    }

    async fn list_bfd_sessions(&self, tag: &ExternalIds) -> egress_core::Result<Vec<BfdSession>> {
        let found = self
            .select("BFD", vec![includes("external_ids", tag)], &BFD_COLUMNS)
            .await
            .nb("list", "bfd sessions")?;
        found
            .iter()
            .map(bfd_from_row)
            .collect::<Result<Vec<_>>>()
            .nb("list", "bfd sessions")
    }

    async fn create_bfd_session(
        &self,
        logical_port: &str,
        dst_ip: &str,
        params: &BfdParams,
        external_ids: &ExternalIds,
    ) -> egress_core::Result<BfdSession> {
        let mut row = bfd_params_row(params);
        row["logical_port"] = Value::from(logical_port);
        row["dst_ip"] = Value::from(dst_ip);
        row["external_ids"] = map(external_ids);

        let id = self.insert("BFD", row).await.nb("create", dst_ip)?;
        Ok(BfdSession {
            uuid: id,
            logical_port: logical_port.to_string(),
            dst_ip: dst_ip.to_string(),
            params: *params,
            external_ids: external_ids.clone(),
        })
    }

    async fn update_bfd_session(&self, id: &str, params: &BfdParams) -> egress_core::Result<()> {
        self.update("BFD", vec![eq("_uuid", uuid(id))], bfd_params_row(params), id)
            .await
            .nb("update", id)
    }

    async fn delete_bfd_session(&self, id: &str) -> egress_core::Result<()> {
        self.delete("BFD", vec![eq("_uuid", uuid(id))]).await.nb("delete", id)
    }

    async fn list_router_policies(
        &self,
        router: &str,
        priority: Option<i64>,
        tag: &ExternalIds,
    ) -> egress_core::Result<Vec<RouterPolicy>> {
        self.policies(router, priority, tag).await.nb("list", router)
    }

    async fn create_router_policy(&self, router: &str, policy: &RouterPolicy) -> egress_core::Result<String> {
        self.add_policy(router, policy).await.nb("create", &policy.match_expr)
    }

    async fn update_router_policy(
        &self,
        id: &str,
        next_hops: &[String],
        bfd_sessions: &[String],
    ) -> egress_core::Result<()> {
        self.update(
            "Logical_Router_Policy",
            vec![eq("_uuid", uuid(id))],
            json!({"nexthops": string_set(next_hops), "bfd_sessions": uuid_set(bfd_sessions)}),
            id,
        )
        .await
        .nb("update", id)
    }

    async fn delete_router_policy(&self, router: &str, id: &str) -> egress_core::Result<()> {
        self.remove_policy(router, id).await.nb("delete", id)
    }
}
