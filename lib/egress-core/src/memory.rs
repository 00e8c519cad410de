//! In-memory northbound database
//!
//! Implements `NbClient` over plain maps. Every write is recorded in a log
//! so callers can assert on what a pass changed and in which order. Like the
//! real database it refuses to delete a BFD session still referenced by a
//! router policy, and to create a policy referencing an unknown session.

use crate::nb::{AddressSet, BfdParams, BfdSession, NbClient, PortGroup, RouterPolicy};
use crate::tag::is_tagged;
use crate::{CoreError, ExternalIds, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// Kind of northbound object
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    PortGroup,
    AddressSet,
    BfdSession,
    RouterPolicy,
}

/// Operation issued against the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    List,
    Create,
    Update,
    Delete,
}

/// A recorded write
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Write {
    pub op: Operation,
    pub kind: ObjectKind,
    /// Name for port groups and address sets, uuid otherwise
    pub id: String,
}

#[derive(Default)]
struct State {
    port_groups: BTreeMap<String, PortGroup>,
    address_sets: BTreeMap<String, AddressSet>,
    bfd_sessions: BTreeMap<String, BfdSession>,
    policies: BTreeMap<String, RouterPolicy>,
    // router name -> policy uuids
    routers: BTreeMap<String, BTreeSet<String>>,
    writes: Vec<Write>,
    fail_next: Option<(Operation, ObjectKind)>,
}

impl State {
    fn check(&mut self, op: Operation, kind: ObjectKind, id: &str) -> Result<()> {
        if self.fail_next == Some((op, kind)) {
            self.fail_next = None;
            return Err(CoreError::northbound(op_name(op), id, "injected failure"));
        }
        Ok(())
    }

    fn record(&mut self, op: Operation, kind: ObjectKind, id: &str) {
        self.writes.push(Write {
            op,
            kind,
            id: id.to_string(),
        });
    }

    fn session_referenced(&self, uuid: &str) -> bool {
        self.policies
            .values()
            .any(|p| p.bfd_sessions.iter().any(|s| s == uuid))
    }
}

fn op_name(op: Operation) -> &'static str {
    match op {
        Operation::List => "list",
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
    }
}

/// In-memory `NbClient`
#[derive(Default)]
pub struct MemoryNb {
    state: Mutex<State>,
}

impl MemoryNb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next matching call fail
    pub fn fail_next(&self, op: Operation, kind: ObjectKind) {
        self.state.lock().fail_next = Some((op, kind));
    }

    /// Writes recorded so far, in order
    pub fn writes(&self) -> Vec<Write> {
        self.state.lock().writes.clone()
    }

    pub fn clear_writes(&self) {
        self.state.lock().writes.clear();
    }

    pub fn port_groups(&self) -> Vec<PortGroup> {
        self.state.lock().port_groups.values().cloned().collect()
    }

    pub fn address_sets(&self) -> Vec<AddressSet> {
        self.state.lock().address_sets.values().cloned().collect()
    }

    pub fn bfd_sessions(&self) -> Vec<BfdSession> {
        self.state.lock().bfd_sessions.values().cloned().collect()
    }

    /// Policies attached to `router`
    pub fn policies(&self, router: &str) -> Vec<RouterPolicy> {
        let state = self.state.lock();
        state
            .routers
            .get(router)
            .map(|uuids| {
                uuids
                    .iter()
                    .filter_map(|uuid| state.policies.get(uuid).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Seed a port group without recording a write
    pub fn insert_port_group(&self, group: PortGroup) {
        self.state.lock().port_groups.insert(group.name.clone(), group);
    }

    /// Seed an address set without recording a write
    pub fn insert_address_set(&self, set: AddressSet) {
        self.state.lock().address_sets.insert(set.name.clone(), set);
    }

    /// Seed a BFD session without recording a write
    pub fn insert_bfd_session(&self, session: BfdSession) {
        self.state.lock().bfd_sessions.insert(session.uuid.clone(), session);
    }

    /// Seed a router policy without recording a write
    pub fn insert_policy(&self, router: &str, policy: RouterPolicy) {
        let mut state = self.state.lock();
        state
            .routers
            .entry(router.to_string())
            .or_default()
            .insert(policy.uuid.clone());
        state.policies.insert(policy.uuid.clone(), policy);
    }
}

#[async_trait]
impl NbClient for MemoryNb {
    async fn get_port_group(&self, name: &str) -> Result<Option<PortGroup>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::PortGroup, name)?;
        Ok(state.port_groups.get(name).cloned())
    }

    async fn list_port_groups(&self, tag: &ExternalIds) -> Result<Vec<PortGroup>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::PortGroup, "port groups")?;
        Ok(state
            .port_groups
            .values()
            .filter(|pg| is_tagged(&pg.external_ids, tag))
            .cloned()
            .collect())
    }

    async fn create_port_group(&self, name: &str, external_ids: &ExternalIds) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Create, ObjectKind::PortGroup, name)?;
        if state.port_groups.contains_key(name) {
            return Err(CoreError::northbound("create", name, "port group already exists"));
        }
        let group = PortGroup {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            ports: Vec::new(),
            external_ids: external_ids.clone(),
        };
        state.port_groups.insert(name.to_string(), group);
        state.record(Operation::Create, ObjectKind::PortGroup, name);
        Ok(())
    }

    async fn set_port_group_ports(&self, name: &str, ports: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Update, ObjectKind::PortGroup, name)?;
        let group = state
            .port_groups
            .get_mut(name)
            .ok_or_else(|| CoreError::northbound("update", name, "port group not found"))?;
        group.ports = ports.to_vec();
        state.record(Operation::Update, ObjectKind::PortGroup, name);
        Ok(())
    }

    async fn delete_port_group(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Delete, ObjectKind::PortGroup, name)?;
        if state.port_groups.remove(name).is_some() {
            state.record(Operation::Delete, ObjectKind::PortGroup, name);
        }
        Ok(())
    }

    async fn get_address_set(&self, name: &str) -> Result<Option<AddressSet>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::AddressSet, name)?;
        Ok(state.address_sets.get(name).cloned())
    }

    async fn list_address_sets(&self, tag: &ExternalIds) -> Result<Vec<AddressSet>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::AddressSet, "address sets")?;
        Ok(state
            .address_sets
            .values()
            .filter(|set| is_tagged(&set.external_ids, tag))
            .cloned()
            .collect())
    }

    async fn create_address_set(&self, name: &str, external_ids: &ExternalIds) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Create, ObjectKind::AddressSet, name)?;
        if state.address_sets.contains_key(name) {
            return Err(CoreError::northbound("create", name, "address set already exists"));
        }
        let set = AddressSet {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            addresses: Vec::new(),
            external_ids: external_ids.clone(),
        };
        state.address_sets.insert(name.to_string(), set);
        state.record(Operation::Create, ObjectKind::AddressSet, name);
        Ok(())
    }

    async fn set_address_set_addresses(&self, name: &str, addresses: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Update, ObjectKind::AddressSet, name)?;
        let set = state
            .address_sets
            .get_mut(name)
            .ok_or_else(|| CoreError::northbound("update", name, "address set not found"))?;
        set.addresses = addresses.to_vec();
        state.record(Operation::Update, ObjectKind::AddressSet, name);
        Ok(())
    }

    async fn delete_address_set(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Delete, ObjectKind::AddressSet, name)?;
        if state.address_sets.remove(name).is_some() {
            state.record(Operation::Delete, ObjectKind::AddressSet, name);
        }
        Ok(())
    }

    async fn list_bfd_sessions(&self, tag: &ExternalIds) -> Result<Vec<BfdSession>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::BfdSession, "bfd sessions")?;
        Ok(state
            .bfd_sessions
            .values()
            .filter(|bfd| is_tagged(&bfd.external_ids, tag))
            .cloned()
            .collect())
    }

    async fn create_bfd_session(
        &self,
        logical_port: &str,
        dst_ip: &str,
        params: &BfdParams,
        external_ids: &ExternalIds,
    ) -> Result<BfdSession> {
        let mut state = self.state.lock();
        state.check(Operation::Create, ObjectKind::BfdSession, dst_ip)?;
        let session = BfdSession {
            uuid: Uuid::new_v4().to_string(),
            logical_port: logical_port.to_string(),
            dst_ip: dst_ip.to_string(),
            params: *params,
            external_ids: external_ids.clone(),
        };
        state.bfd_sessions.insert(session.uuid.clone(), session.clone());
        state.record(Operation::Create, ObjectKind::BfdSession, &session.uuid);
        Ok(session)
    }

    async fn update_bfd_session(&self, uuid: &str, params: &BfdParams) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Update, ObjectKind::BfdSession, uuid)?;
        let session = state
            .bfd_sessions
            .get_mut(uuid)
            .ok_or_else(|| CoreError::northbound("update", uuid, "bfd session not found"))?;
        session.params = *params;
        state.record(Operation::Update, ObjectKind::BfdSession, uuid);
        Ok(())
    }

    async fn delete_bfd_session(&self, uuid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Delete, ObjectKind::BfdSession, uuid)?;
        if state.session_referenced(uuid) {
            return Err(CoreError::northbound("delete", uuid, "bfd session is referenced by a router policy"));
        }
        if state.bfd_sessions.remove(uuid).is_some() {
            state.record(Operation::Delete, ObjectKind::BfdSession, uuid);
        }
        Ok(())
    }

    async fn list_router_policies(
        &self,
        router: &str,
        priority: Option<i64>,
        tag: &ExternalIds,
    ) -> Result<Vec<RouterPolicy>> {
        let mut state = self.state.lock();
        state.check(Operation::List, ObjectKind::RouterPolicy, router)?;
        let Some(uuids) = state.routers.get(router) else {
            return Ok(Vec::new());
        };
        Ok(uuids
            .iter()
            .filter_map(|uuid| state.policies.get(uuid))
            .filter(|p| priority.map_or(true, |prio| p.priority == prio))
            .filter(|p| is_tagged(&p.external_ids, tag))
            .cloned()
            .collect())
    }

    async fn create_router_policy(&self, router: &str, policy: &RouterPolicy) -> Result<String> {
        let mut state = self.state.lock();
        state.check(Operation::Create, ObjectKind::RouterPolicy, &policy.match_expr)?;
        if let Some(missing) = policy
            .bfd_sessions
            .iter()
            .find(|uuid| !state.bfd_sessions.contains_key(*uuid))
        {
            return Err(CoreError::northbound(
                "create",
                policy.match_expr.clone(),
                format!("unknown bfd session {}", missing),
            ));
        }
        let uuid = Uuid::new_v4().to_string();
        let mut created = policy.clone();
        created.uuid = uuid.clone();
        state.policies.insert(uuid.clone(), created);
        state.routers.entry(router.to_string()).or_default().insert(uuid.clone());
        state.record(Operation::Create, ObjectKind::RouterPolicy, &uuid);
        Ok(uuid)
    }

    async fn update_router_policy(&self, uuid: &str, next_hops: &[String], bfd_sessions: &[String]) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Update, ObjectKind::RouterPolicy, uuid)?;
        if let Some(missing) = bfd_sessions.iter().find(|s| !state.bfd_sessions.contains_key(*s)) {
            return Err(CoreError::northbound("update", uuid, format!("unknown bfd session {}", missing)));
        }
        let policy = state
            .policies
            .get_mut(uuid)
            .ok_or_else(|| CoreError::northbound("update", uuid, "router policy not found"))?;
        policy.next_hops = next_hops.to_vec();
        policy.bfd_sessions = bfd_sessions.to_vec();
        state.record(Operation::Update, ObjectKind::RouterPolicy, uuid);
        Ok(())
    }

    async fn delete_router_policy(&self, router: &str, uuid: &str) -> Result<()> {
        let mut state = self.state.lock();
        state.check(Operation::Delete, ObjectKind::RouterPolicy, uuid)?;
        if let Some(uuids) = state.routers.get_mut(router) {
            uuids.remove(uuid);
        }
        if state.policies.remove(uuid).is_some() {
            state.record(Operation::Delete, ObjectKind::RouterPolicy, uuid);
        }
        Ok(())
    }
}
