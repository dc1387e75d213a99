//! Clocked lifetimes and properties, shared by nodes and edges.

use weaver::clock::VectorClock;

use crate::order::TimeOracle;

/// One property record. Setting a key again tombstones the previous record,
/// so history stays readable at older clocks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
    pub created: VectorClock,
    pub deleted: Option<VectorClock>,
}

impl Property {
    /// Visible at `at` iff `created ≤ at < deleted`.
    pub fn visible_at(&self, at: &VectorClock, oracle: &TimeOracle) -> bool {
        if !oracle.before_eq(&self.created, at) {
            return false;
        }
        match self.deleted {
            Some(ref del) => oracle.strictly_before(at, del),
            None => true,
        }
    }
}

/// The clocked core of a node or edge: lifetime plus properties.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Element {
    created: VectorClock,
    deleted: Option<VectorClock>,
    properties: Vec<Property>,
}

impl Element {
    pub fn new(created: VectorClock) -> Self {
        Element {
            created,
            deleted: None,
            properties: Vec::new(),
        }
    }

    pub fn created(&self) -> &VectorClock {
        &self.created
    }

    pub fn deleted(&self) -> Option<&VectorClock> {
        self.deleted.as_ref()
    }

    /// Alive at `at` iff `created ≤ at < deleted`.
    pub fn alive_at(&self, at: &VectorClock, oracle: &TimeOracle) -> bool {
        if !oracle.before_eq(&self.created, at) {
            return false;
        }
        match self.deleted {
            Some(ref del) => oracle.strictly_before(at, del),
            None => true,
        }
    }

    /// Tombstone; the element remains readable at clocks before `at`.
    ///
    /// The caller has established the element is alive at `at` under the
    /// resolved order, so when a tombstone already exists it must sit after
    /// `at`: concurrent deletes shrink the window to the earliest clock.
    pub fn delete(&mut self, at: VectorClock) {
        self.deleted = Some(at);
    }

    /// Append a property record, ending the life of any record currently
    /// live under the same key.
    pub fn set_property(&mut self, key: &str, value: &str, at: &VectorClock, oracle: &TimeOracle) {
        for prop in self.properties.iter_mut() {
            if prop.key == key && prop.deleted.is_none() && oracle.before_eq(&prop.created, at) {
                prop.deleted = Some(at.clone());
            }
        }
        self.properties.push(Property {
            key: key.to_owned(),
            value: value.to_owned(),
            created: at.clone(),
            deleted: None,
        });
    }

    pub fn properties_at(&self, at: &VectorClock, oracle: &TimeOracle) -> Vec<(String, String)> {
        self.properties
            .iter()
            .filter(|p| p.visible_at(at, oracle))
            .map(|p| (p.key.clone(), p.value.clone()))
            .collect()
    }

    pub fn has_property(
        &self,
        key: &str,
        value: &str,
        at: &VectorClock,
        oracle: &TimeOracle,
    ) -> bool {
        self.properties
            .iter()
            .any(|p| p.key == key && p.value == value && p.visible_at(at, oracle))
    }

    pub fn has_all_properties(
        &self,
        props: &[(String, String)],
        at: &VectorClock,
        oracle: &TimeOracle,
    ) -> bool {
        props
            .iter()
            .all(|(k, v)| self.has_property(k, v, at, oracle))
    }
}
