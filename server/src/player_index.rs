//! Bijective index over the three player identities of one battle.
//!
//! Within a battle, user id, display name and engine player number each
//! identify the same participant; the index keeps the three-way mapping and
//! refuses inserts that would break the bijection.

use std::collections::HashMap;

use thiserror::Error;

/// The identity triple of one battle participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub user_id: String,
    pub name: String,
    pub player_number: u8,
}

/// A record that shares some but not all fields with an existing one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("identity collision on {field}")]
pub struct IdentityCollision {
    pub field: &'static str,
}

#[derive(Debug, Default)]
pub struct PlayerIndex {
    by_user_id: HashMap<String, PlayerIdentity>,
    // Secondary keys map back to the user id.
    by_name: HashMap<String, String>,
    by_number: HashMap<u8, String>,
}

impl PlayerIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an identity. Re-inserting an identical record is a no-op;
    /// a record that collides with an existing one on any field fails.
    pub fn insert(&mut self, identity: PlayerIdentity) -> Result<(), IdentityCollision> {
        if let Some(existing) = self.by_user_id.get(&identity.user_id) {
            if *existing == identity {
                return Ok(());
            }
            return Err(IdentityCollision { field: "userId" });
        }
        if let Some(owner) = self.by_name.get(&identity.name) {
            if *owner != identity.user_id {
                return Err(IdentityCollision { field: "name" });
            }
        }
        if let Some(owner) = self.by_number.get(&identity.player_number) {
            if *owner != identity.user_id {
                return Err(IdentityCollision {
                    field: "playerNumber",
                });
            }
        }
        self.by_name
            .insert(identity.name.clone(), identity.user_id.clone());
        self.by_number
            .insert(identity.player_number, identity.user_id.clone());
        self.by_user_id.insert(identity.user_id.clone(), identity);
        Ok(())
    }

    pub fn by_user_id(&self, user_id: &str) -> Option<&PlayerIdentity> {
        self.by_user_id.get(user_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&PlayerIdentity> {
        self.by_name
            .get(name)
            .and_then(|user_id| self.by_user_id.get(user_id))
    }

    pub fn by_number(&self, player_number: u8) -> Option<&PlayerIdentity> {
        self.by_number
            .get(&player_number)
            .and_then(|user_id| self.by_user_id.get(user_id))
    }

    pub fn remove_by_user_id(&mut self, user_id: &str) -> Option<PlayerIdentity> {
        let identity = self.by_user_id.remove(user_id)?;
        self.by_name.remove(&identity.name);
        self.by_number.remove(&identity.player_number);
        Some(identity)
    }

    pub fn len(&self) -> usize {
        self.by_user_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_user_id.is_empty()
    }
}
