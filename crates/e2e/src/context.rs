//! Execution context shared by the tests of a workflow (or a whole pipeline)

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use tidyrun_common::{ResourceLedger, SessionId, TrackedResource};

use crate::definition::Variables;

/// Variables, tracked resources and the last received email of one run.
///
/// Variables set while a scope (pipeline node or test) is open are also
/// recorded under that scope's id, so later steps can read them back as
/// `${<id>.VAR}`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    session_id: SessionId,
    started_at: DateTime<Utc>,
    variables: Variables,
    outputs: IndexMap<String, Variables>,
    scopes: Vec<String>,
    ledger: ResourceLedger,
    last_email: Option<Value>,
}

impl ExecutionContext {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            started_at: Utc::now(),
            variables: Variables::new(),
            outputs: IndexMap::new(),
            scopes: Vec::new(),
            ledger: ResourceLedger::new(),
            last_email: None,
        }
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Set a variable; later writes override earlier ones.
    pub fn set_var(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        for scope in &self.scopes {
            self.outputs
                .entry(scope.clone())
                .or_default()
                .insert(name.clone(), value.clone());
        }
        self.variables.insert(name, value);
    }

    pub fn var(&self, name: &str) -> Option<&str> {
        self.variables.get(name).map(String::as_str)
    }

    /// Resolve `NAME` or `<scope>.NAME`.
    pub fn lookup(&self, reference: &str) -> Option<&str> {
        if let Some(value) = self.var(reference) {
            return Some(value);
        }
        let (scope, name) = reference.split_once('.')?;
        self.outputs
            .get(scope)
            .and_then(|vars| vars.get(name))
            .map(String::as_str)
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    /// Variables recorded under a scope id
    pub fn outputs_of(&self, scope: &str) -> Option<&Variables> {
        self.outputs.get(scope)
    }

    pub fn push_scope(&mut self, id: impl Into<String>) {
        let id = id.into();
        self.outputs.entry(id.clone()).or_default();
        self.scopes.push(id);
    }

    pub fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    pub fn ledger(&self) -> &ResourceLedger {
        &self.ledger
    }

    /// Record a resource, stamping it with the current time if the reporter
    /// did not. Returns `true` if it was new.
    pub fn track(&mut self, mut resource: TrackedResource) -> bool {
        if resource.created_at.is_none() {
            resource.created_at = Some(Utc::now());
        }
        self.ledger.push(resource)
    }

    /// Merge externally reported resources, returning how many were new.
    pub fn merge_resources<I>(&mut self, resources: I) -> usize
    where
        I: IntoIterator<Item = TrackedResource>,
    {
        resources
            .into_iter()
            .map(|r| self.track(r))
            .filter(|added| *added)
            .count()
    }

    pub fn mark_deleted(&mut self, resource_type: &str, id: &str) -> bool {
        self.ledger.mark_deleted(resource_type, id)
    }

    pub fn last_email(&self) -> Option<&Value> {
        self.last_email.as_ref()
    }

    pub fn set_last_email(&mut self, email: Value) {
        self.last_email = Some(email);
    }
}
