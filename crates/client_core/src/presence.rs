use std::collections::HashMap;

use shared::{
    domain::{ContactPresence, UserId},
    protocol::UserSummary,
};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::ClientEvent;

/// Online flags for known contacts, fed by `user_online`/`user_offline`.
pub struct PresenceTracker {
    contacts: RwLock<HashMap<UserId, ContactPresence>>,
    events: broadcast::Sender<ClientEvent>,
}

impl PresenceTracker {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            contacts: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Replaces the contact list with the server's snapshot.
    pub async fn seed(&self, users: &[UserSummary]) {
        let mut contacts = self.contacts.write().await;
        contacts.clear();
        for user in users {
            contacts.insert(
                user.id.clone(),
                ContactPresence {
                    user_id: user.id.clone(),
                    name: user.name.clone(),
                    online: user.online,
                },
            );
        }
        debug!(contacts = contacts.len(), "presence: seeded contact list");
    }

    /// Records a presence flip. Returns whether the flag changed.
    pub async fn set_online(&self, user_id: &UserId, online: bool) -> bool {
        {
            let mut contacts = self.contacts.write().await;
            let contact = contacts
                .entry(user_id.clone())
                .or_insert_with(|| ContactPresence {
                    user_id: user_id.clone(),
                    name: None,
                    online: false,
                });
            if contact.online == online {
                return false;
            }
            contact.online = online;
        }
        debug!(user_id = %user_id, online, "presence: contact changed");
        let _ = self.events.send(ClientEvent::PresenceChanged {
            user_id: user_id.clone(),
            online,
        });
        true
    }

    pub async fn is_online(&self, user_id: &UserId) -> bool {
        self.contacts
            .read()
            .await
            .get(user_id)
            .is_some_and(|contact| contact.online)
    }

    pub async fn contacts(&self) -> Vec<ContactPresence> {
        let mut contacts: Vec<ContactPresence> =
            self.contacts.read().await.values().cloned().collect();
        contacts.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        contacts
    }
}
