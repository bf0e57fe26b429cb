//! Contact list and view state.
//!
//! [`ContactBook`] is the only writer of contact summaries. Every change
//! goes through one of its merge functions so concurrent events combine
//! instead of overwriting each other.

use std::collections::HashMap;

use parley_shared::{Address, Contact, Message};

#[derive(Debug, Default)]
pub struct ContactBook {
    contacts: HashMap<String, Contact>,
}

impl ContactBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_contacts(contacts: impl IntoIterator<Item = Contact>) -> Self {
        Self {
            contacts: contacts
                .into_iter()
                .map(|c| (c.address.clone(), c))
                .collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Contact> {
        self.contacts.get(&id.to_lowercase())
    }

    /// Insert a contact or group unless it is already known.
    pub fn ensure(&mut self, contact: Contact) -> &Contact {
        self.contacts
            .entry(contact.address.clone())
            .or_insert(contact)
    }

    /// Fold a stored message into its conversation's summary. Inbound
    /// messages count as unread unless `seen`.
    pub fn observe_message(&mut self, message: &Message, local: &Address, seen: bool) -> &Contact {
        let id = message.conversation_id(local);
        let contact = self.contacts.entry(id.clone()).or_insert_with(|| match &message.group_id {
            Some(group) => Contact::group(group, Vec::new()),
            None => Contact::new(&id),
        });

        let (at, _) = message.sort_key();
        contact.last_message_time = contact.last_message_time.max(at);
        if contact.is_group && !contact.members.contains(&message.from) && &message.from != local {
            contact.members.push(message.from.clone());
        }
        if &message.from != local && !seen {
            contact.unread_count = contact.unread_count.saturating_add(1);
        }
        contact
    }

    pub fn mark_read(&mut self, id: &str) -> Option<&Contact> {
        let contact = self.contacts.get_mut(&id.to_lowercase())?;
        contact.unread_count = 0;
        Some(contact)
    }

    /// Add `count` unread messages found during reconciliation.
    pub fn apply_unread(&mut self, id: &str, count: u32, last_message_time: i64) -> Option<&Contact> {
        let contact = self.contacts.get_mut(&id.to_lowercase())?;
        contact.unread_count = contact.unread_count.saturating_add(count);
        contact.last_message_time = contact.last_message_time.max(last_message_time);
        Some(contact)
    }

    pub fn set_username(&mut self, id: &str, username: Option<String>) -> Option<&Contact> {
        let contact = self.contacts.get_mut(&id.to_lowercase())?;
        if username.is_some() {
            contact.username = username;
        }
        Some(contact)
    }

    /// Most recently active first.
    pub fn sorted(&self) -> Vec<Contact> {
        let mut contacts: Vec<_> = self.contacts.values().cloned().collect();
        contacts.sort_by(|a, b| {
            b.last_message_time
                .cmp(&a.last_message_time)
                .then_with(|| a.address.cmp(&b.address))
        });
        contacts
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenConversation {
    Peer(Address),
    Group(String),
}

/// Which conversation, if any, the user is looking at.
#[derive(Debug, Clone, Default)]
pub struct ViewState {
    open: Option<OpenConversation>,
}

impl ViewState {
    pub fn open(&mut self, conversation: OpenConversation) {
        self.open = Some(conversation);
    }

    pub fn close(&mut self) {
        self.open = None;
    }

    pub fn current(&self) -> Option<&OpenConversation> {
        self.open.as_ref()
    }

    /// Conversation id of the open conversation.
    pub fn conversation_id(&self) -> Option<String> {
        self.open.as_ref().map(|open| match open {
            OpenConversation::Peer(address) => address.as_str().to_string(),
            OpenConversation::Group(group) => group.to_lowercase(),
        })
    }

    /// Whether `message` belongs on screen: a group message for the open
    /// group, or a direct message to or from the open peer.
    pub fn is_visible(&self, message: &Message) -> bool {
        match (&self.open, &message.group_id) {
            (Some(OpenConversation::Group(open)), Some(group)) => open.eq_ignore_ascii_case(group),
            (Some(OpenConversation::Peer(peer)), None) => {
                &message.from == peer || message.to.eq_ignore_ascii_case(peer.as_str())
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use parley_shared::{MessageStatus, Transport};

    use super::*;

    fn message(id: &str, from: &str, to: &str, group: Option<&str>, at: i64) -> Message {
        Message {
            id: id.into(),
            from: Address::new(from),
            to: to.into(),
            group_id: group.map(str::to_string),
            content: "hi".into(),
            encrypted: None,
            nonce: None,
            sender_public_key: String::new(),
            timestamp: at,
            saved_at: None,
            status: MessageStatus::Sent,
            transport: Transport::Relay,
            reply_to: None,
            decryption_failed: false,
        }
    }

    #[test]
    fn inbound_messages_count_unread_until_marked() {
        let local = Address::new("aa");
        let mut book = ContactBook::new();

        book.observe_message(&message("m1", "bb", "aa", None, 5), &local, false);
        book.observe_message(&message("m2", "aa", "bb", None, 7), &local, false);
        let contact = book.observe_message(&message("m3", "bb", "aa", None, 6), &local, false);
        assert_eq!(contact.unread_count, 2);
        assert_eq!(contact.last_message_time, 7);

        assert_eq!(book.mark_read("BB").unwrap().unread_count, 0);
        book.observe_message(&message("m4", "bb", "aa", None, 8), &local, true);
        assert_eq!(book.get("bb").unwrap().unread_count, 0);
    }

    #[test]
    fn group_messages_collect_members() {
        let local = Address::new("aa");
        let mut book = ContactBook::new();
        book.observe_message(&message("m1", "bb", "team", Some("Team"), 1), &local, false);
        book.observe_message(&message("m2", "cc", "team", Some("team"), 2), &local, false);
        book.observe_message(&message("m3", "aa", "team", Some("team"), 3), &local, false);

        let group = book.get("team").unwrap();
        assert!(group.is_group);
        assert_eq!(group.members, vec![Address::new("bb"), Address::new("cc")]);
        assert_eq!(group.unread_count, 2);
    }

    #[test]
    fn sorted_by_activity() {
        let local = Address::new("aa");
        let mut book = ContactBook::new();
        book.observe_message(&message("m1", "bb", "aa", None, 1), &local, false);
        book.observe_message(&message("m2", "cc", "aa", None, 9), &local, false);
        book.apply_unread("bb", 3, 20);

        let order: Vec<_> = book.sorted().into_iter().map(|c| c.address).collect();
        assert_eq!(order, ["bb", "cc"]);
        assert_eq!(book.get("bb").unwrap().unread_count, 4);
        assert!(book.apply_unread("zz", 1, 0).is_none());
    }

    #[test]
    fn visibility_follows_open_conversation() {
        let mut view = ViewState::default();
        let direct = message("m1", "bb", "aa", None, 1);
        let group = message("m2", "bb", "team", Some("team"), 1);
        assert!(!view.is_visible(&direct));

        view.open(OpenConversation::Peer(Address::new("BB")));
        assert!(view.is_visible(&direct));
        assert!(!view.is_visible(&group));

        view.open(OpenConversation::Group("Team".into()));
        assert!(view.is_visible(&group));
        assert!(!view.is_visible(&direct));
        assert_eq!(view.conversation_id().as_deref(), Some("team"));
    }
}
