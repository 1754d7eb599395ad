//! Lock keyset computation for a bundle.

use crate::bundle::{Bundle, BundleEntry, EntryOperation, EntryTarget};
use crate::exception::{VitalError, VitalResult};
use crate::reference::is_symbolic;
use crate::store::ResourceKey;
use crate::transactions::locks::normalize_keys;
use std::collections::HashSet;

/// Key an entry could race on with another bundle, if any.
///
/// Reads and plain creates contribute nothing. Targets that mention a symbolic id name
/// resources this bundle creates, which no other bundle can address yet.
pub fn entry_lock_key(entry: &BundleEntry) -> Option<ResourceKey> {
    if !entry.operation.is_mutation() || entry.operation == EntryOperation::Create {
        return None;
    }
    if is_symbolic(&entry.target) || entry.target.split(['?', '&', '=']).any(is_symbolic) {
        return None;
    }

    // Unparseable targets fail when the entry executes
    match EntryTarget::parse(&entry.target).ok()? {
        EntryTarget::Instance { resource_type, id } => {
            Some(ResourceKey::instance(&resource_type, &id))
        }
        EntryTarget::Conditional {
            resource_type,
            criteria,
        } => Some(ResourceKey::conditional(&resource_type, &criteria)),
        EntryTarget::Type(_) => None,
    }
}

/// Union of every entry's key, sorted and deduplicated
pub fn lock_keys(bundle: &Bundle) -> Vec<ResourceKey> {
    let keys: Vec<ResourceKey> = bundle.entries.iter().filter_map(entry_lock_key).collect();
    normalize_keys(&keys)
}

/// Bundle-level checks made before any lock is taken
pub fn validate_bundle(bundle: &Bundle) -> VitalResult<()> {
    let mut seen = HashSet::new();
    for (index, entry) in bundle.entries.iter().enumerate() {
        if let Some(symbolic_id) = &entry.symbolic_id {
            if !seen.insert(symbolic_id.as_str()) {
                return Err(VitalError::validation(format!(
                    "entry {index} repeats fullUrl '{symbolic_id}'"
                )));
            }
        }
    }
    Ok(())
}
