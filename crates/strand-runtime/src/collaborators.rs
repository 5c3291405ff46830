//! Default collaborator implementations used when a node is built from
//! configuration alone

use std::collections::{BTreeMap, HashMap, HashSet};
use strand_core::{
    AuditError, AuditRecord, AuditSink, FlowInitiator, IdentityEffects, IdentityError,
    NetworkIdentity, PartyName, PermissionEvaluator,
};

/// Permission that grants every other permission
pub const ALL_PERMISSIONS: &str = "ALL";

/// Audit sink that writes every record to the `strand::audit` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingAuditSink;

impl AuditSink for LoggingAuditSink {
    fn record(&self, record: AuditRecord) -> Result<(), AuditError> {
        tracing::info!(
            target: "strand::audit",
            id = %record.id,
            run_id = %record.run_id,
            principal = %record.principal,
            kind = ?record.kind,
            comment = %record.comment,
            data = ?record.data,
            "Audit record"
        );
        Ok(())
    }
}

/// Static grants of permissions to principals
#[derive(Debug, Default, Clone)]
pub struct PermissionTable {
    grants: HashMap<String, HashSet<String>>,
}

impl PermissionTable {
    /// Table granting nothing
    pub fn new() -> Self {
        Self::default()
    }

    /// Table from the `[permissions]` config section
    pub fn from_config(grants: &BTreeMap<String, Vec<String>>) -> Self {
        let mut table = Self::new();
        for (principal, permissions) in grants {
            for permission in permissions {
                table = table.grant(principal.as_str(), permission.as_str());
            }
        }
        table
    }

    /// Grant `permission` to `principal`
    pub fn grant(mut self, principal: impl Into<String>, permission: impl Into<String>) -> Self {
        self.grants
            .entry(principal.into())
            .or_default()
            .insert(permission.into());
        self
    }
}

impl PermissionEvaluator for PermissionTable {
    fn has_permission(&self, initiator: &FlowInitiator, permission: &str) -> bool {
        self.grants
            .get(&initiator.principal())
            .map(|granted| granted.contains(permission) || granted.contains(ALL_PERMISSIONS))
            .unwrap_or(false)
    }
}

/// Party resolution from a fixed address book
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity {
    peers: HashMap<PartyName, String>,
}

impl StaticIdentity {
    /// Empty address book
    pub fn new() -> Self {
        Self::default()
    }

    /// Address book from the `[peers]` config section
    pub fn from_config(peers: &BTreeMap<String, String>) -> Self {
        peers
            .iter()
            .fold(Self::new(), |book, (party, address)| {
                book.with_peer(party.as_str(), address.as_str())
            })
    }

    /// Add or replace one entry
    pub fn with_peer(mut self, party: impl Into<PartyName>, address: impl Into<String>) -> Self {
        self.peers.insert(party.into(), address.into());
        self
    }

    /// Whether `party` is known
    pub fn knows(&self, party: &PartyName) -> bool {
        self.peers.contains_key(party)
    }
}

impl IdentityEffects for StaticIdentity {
    fn resolve(&self, party: &PartyName) -> Result<NetworkIdentity, IdentityError> {
        self.peers
            .get(party)
            .map(|address| NetworkIdentity::new(party.clone(), address.clone()))
            .ok_or_else(|| IdentityError::UnknownParty {
                party: party.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grants_follow_principal() {
        let config = BTreeMap::from([
            ("alice".to_string(), vec!["StartFlow.Issue".to_string()]),
            ("ops".to_string(), vec![ALL_PERMISSIONS.to_string()]),
        ]);
        let table = PermissionTable::from_config(&config);

        assert!(table.has_permission(&FlowInitiator::rpc("alice"), "StartFlow.Issue"));
        assert!(!table.has_permission(&FlowInitiator::rpc("alice"), "StartFlow.Settle"));
        assert!(table.has_permission(&FlowInitiator::rpc("ops"), "StartFlow.Settle"));
        assert!(!table.has_permission(&FlowInitiator::rpc("mallory"), "StartFlow.Issue"));
    }

    #[test]
    fn unknown_party_fails_resolution() {
        let book = StaticIdentity::from_config(&BTreeMap::from([(
            "O=Bank B".to_string(),
            "tcp://bank-b:10002".to_string(),
        )]));

        let resolved = book.resolve(&PartyName::new("O=Bank B")).unwrap();
        assert_eq!(resolved.address, "tcp://bank-b:10002");
        assert!(matches!(
            book.resolve(&PartyName::new("O=Bank C")),
            Err(IdentityError::UnknownParty { .. })
        ));
    }

    #[test]
    fn logging_sink_never_fails() {
        let record = AuditRecord::new(
            strand_core::RunId::new(),
            "alice".to_string(),
            strand_core::AuditKind::Event {
                event_type: "test".into(),
            },
            "hello",
            BTreeMap::new(),
        );
        assert!(LoggingAuditSink.record(record).is_ok());
    }
}
