//! Elicitations the proxy answered on the client's behalf
//!
//! The outbound pipeline records each auto-resolved elicitation id. When
//! reply suppression is on, the inbound pipeline consults the map and drops
//! the client's own reply to that id, since the subprocess already has its
//! answer and a second response for one id breaks JSON-RPC correlation.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::protocol::RequestId;

/// Oldest entries are evicted beyond this many unanswered elicitations
const MAX_TRACKED: usize = 1024;

/// Bookkeeping for one auto-resolved elicitation
#[derive(Debug, Clone, PartialEq)]
pub struct ElicitationRecord {
    /// Discriminator value that triggered the approval
    pub kind: Option<Value>,
    pub resolved_at: DateTime<Utc>,
}

/// Shared map from elicitation id to its record
#[derive(Debug, Clone, Default)]
pub struct PendingElicitations {
    inner: Arc<Mutex<HashMap<RequestId, ElicitationRecord>>>,
}

impl PendingElicitations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, id: RequestId, kind: Option<Value>) {
        // Intentional .unwrap() - poisoned mutex indicates serious bug, panic is appropriate
        let mut map = self.inner.lock().unwrap();
        if map.len() >= MAX_TRACKED && !map.contains_key(&id) {
            let oldest = map
                .iter()
                .min_by_key(|(_, record)| record.resolved_at)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                debug!(id = %oldest, "Evicting oldest auto-resolved elicitation");
                map.remove(&oldest);
            }
        }
        map.insert(
            id,
            ElicitationRecord {
                kind,
                resolved_at: Utc::now(),
            },
        );
    }

    /// Remove and return the record for `id`, if the proxy answered it
    pub fn take(&self, id: &RequestId) -> Option<ElicitationRecord> {
        self.inner.lock().unwrap().remove(id)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_then_take_once() {
        let pending = PendingElicitations::new();
        let id = RequestId::from_value(&json!(7)).unwrap();
        pending.record(id.clone(), Some(json!("patch-approval")));
        assert_eq!(pending.len(), 1);

        let record = pending.take(&id).unwrap();
        assert_eq!(record.kind, Some(json!("patch-approval")));
        assert!(pending.take(&id).is_none());
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_numeric_and_string_ids_are_distinct() {
        let pending = PendingElicitations::new();
        pending.record(RequestId::from_value(&json!(1)).unwrap(), None);
        assert!(
            pending
                .take(&RequestId::from_value(&json!("1")).unwrap())
                .is_none()
        );
    }

    #[test]
    fn test_size_is_bounded() {
        let pending = PendingElicitations::new();
        for n in 0..(MAX_TRACKED as u64 + 10) {
            pending.record(RequestId::from_value(&json!(n)).unwrap(), None);
        }
        assert_eq!(pending.len(), MAX_TRACKED);
    }
}
