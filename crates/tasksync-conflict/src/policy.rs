//! Resolution policies
//!
//! A policy decides what the resolver commits for an operation. Sync
//! transactions always use [`ResolutionPolicy::AutoLww`]; the manual
//! policies come from a person's [`ConflictResolutionRequest`].

use std::collections::BTreeMap;

use serde_json::Value;

use tasksync_core::domain::{ConflictResolutionRequest, ResolutionChoice};

use crate::error::ConflictError;

/// How the resolver settles an operation
#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionPolicy {
    /// Commit the operation's value; a detected conflict is recorded, not blocking
    AutoLww,
    /// Force-apply the operation's value
    ManualAcceptClient,
    /// Discard the operation's value and leave the entity's data untouched
    ManualAcceptServer,
    /// Apply a caller-supplied field map as one version bump
    ManualMerge(BTreeMap<String, Value>),
}

impl ResolutionPolicy {
    /// Maps a manual resolution request to a policy
    ///
    /// `merge` requires a non-empty `mergedData`.
    pub fn from_request(request: &ConflictResolutionRequest) -> Result<Self, ConflictError> {
        match request.resolution {
            ResolutionChoice::AcceptClient => Ok(ResolutionPolicy::ManualAcceptClient),
            ResolutionChoice::AcceptServer => Ok(ResolutionPolicy::ManualAcceptServer),
            ResolutionChoice::Merge => match &request.merged_data {
                Some(fields) if !fields.is_empty() => {
                    Ok(ResolutionPolicy::ManualMerge(fields.clone()))
                }
                _ => Err(ConflictError::InvalidRequest(
                    "merge requires non-empty mergedData".to_string(),
                )),
            },
        }
    }

    /// Returns true for policies chosen by a person
    pub fn is_manual(&self) -> bool {
        !matches!(self, ResolutionPolicy::AutoLww)
    }

    /// Stable label for logs and metrics
    pub fn label(&self) -> &'static str {
        match self {
            ResolutionPolicy::AutoLww => "auto_lww",
            ResolutionPolicy::ManualAcceptClient => "accept_client",
            ResolutionPolicy::ManualAcceptServer => "accept_server",
            ResolutionPolicy::ManualMerge(_) => "merge",
        }
    }
}

impl std::fmt::Display for ResolutionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tasksync_core::domain::OperationId;

    use super::*;

    #[test]
    fn test_accept_choices_map_directly() {
        let id = OperationId::new(1);
        assert_eq!(
            ResolutionPolicy::from_request(&ConflictResolutionRequest::new(
                id,
                ResolutionChoice::AcceptClient
            ))
            .unwrap(),
            ResolutionPolicy::ManualAcceptClient
        );
        assert_eq!(
            ResolutionPolicy::from_request(&ConflictResolutionRequest::new(
                id,
                ResolutionChoice::AcceptServer
            ))
            .unwrap(),
            ResolutionPolicy::ManualAcceptServer
        );
    }

    #[test]
    fn test_merge_requires_data() {
        let bare = ConflictResolutionRequest::new(OperationId::new(1), ResolutionChoice::Merge);
        assert!(matches!(
            ResolutionPolicy::from_request(&bare),
            Err(ConflictError::InvalidRequest(_))
        ));

        let empty = bare.clone().with_merged_data(BTreeMap::new());
        assert!(ResolutionPolicy::from_request(&empty).is_err());

        let mut fields = BTreeMap::new();
        fields.insert("title".to_string(), json!("B and C"));
        let merge = bare.with_merged_data(fields.clone());
        assert_eq!(
            ResolutionPolicy::from_request(&merge).unwrap(),
            ResolutionPolicy::ManualMerge(fields)
        );
    }

    #[test]
    fn test_labels() {
        assert!(!ResolutionPolicy::AutoLww.is_manual());
        assert!(ResolutionPolicy::ManualAcceptServer.is_manual());
        assert_eq!(ResolutionPolicy::AutoLww.to_string(), "auto_lww");
        assert_eq!(ResolutionPolicy::ManualMerge(BTreeMap::new()).label(), "merge");
    }
}
