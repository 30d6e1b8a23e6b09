//! Contact book: the peers the local user can converse with

use crate::models::{Contact, PresenceStatus, UserId};

#[derive(Debug, Default)]
pub struct ContactBook {
    contacts: Vec<Contact>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list (initial load or `contacts-update`)
    pub fn replace(&mut self, contacts: Vec<Contact>) {
        self.contacts = contacts;
    }

    pub fn all(&self) -> &[Contact] {
        &self.contacts
    }

    pub fn get(&self, id: UserId) -> Option<&Contact> {
        self.contacts.iter().find(|c| c.id == id)
    }

    pub fn set_status(&mut self, id: UserId, status: PresenceStatus) -> bool {
        match self.contacts.iter_mut().find(|c| c.id == id) {
            Some(contact) => {
                contact.status = status;
                true
            }
            None => false,
        }
    }

    /// Case-insensitive match on username or email
    pub fn filter(&self, term: &str) -> Vec<&Contact> {
        let term = term.trim().to_lowercase();
        self.contacts
            .iter()
            .filter(|c| {
                term.is_empty()
                    || c.username.to_lowercase().contains(&term)
                    || c.email.to_lowercase().contains(&term)
            })
            .collect()
    }
}
