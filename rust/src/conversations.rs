use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentState {
    Allowed,
    Denied,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationKind {
    Dm,
    Group,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub inbox_id: String,
    pub kind: ConversationKind,
    pub consent: ConsentState,
    pub name: Option<String>,
    pub last_activity_at: i64,
}

/// Empty `consent` matches any consent state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationFilter {
    pub consent: Vec<ConsentState>,
    pub kind: Option<ConversationKind>,
    pub inbox_id: Option<String>,
}

impl ConversationFilter {
    pub fn with_consent(consent: impl IntoIterator<Item = ConsentState>) -> Self {
        Self {
            consent: consent.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn kind(mut self, kind: ConversationKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn matches(&self, conversation: &Conversation) -> bool {
        (self.consent.is_empty() || self.consent.contains(&conversation.consent))
            && self.kind.map_or(true, |k| k == conversation.kind)
            && self
                .inbox_id
                .as_deref()
                .map_or(true, |id| id == conversation.inbox_id)
    }
}

/// Storage-backed conversation lists; every view stays live as rows change.
pub trait ConversationsRepository: Send + Sync {
    fn conversations(&self, filter: ConversationFilter) -> watch::Receiver<Vec<Conversation>>;

    fn count(&self, filter: ConversationFilter) -> watch::Receiver<usize>;

    fn remove_inbox(&self, inbox_id: &str);

    fn clear(&self);
}

enum View {
    List(ConversationFilter, watch::Sender<Vec<Conversation>>),
    Count(ConversationFilter, watch::Sender<usize>),
}

impl View {
    fn is_closed(&self) -> bool {
        match self {
            View::List(_, tx) => tx.is_closed(),
            View::Count(_, tx) => tx.is_closed(),
        }
    }

    fn refresh(&self, rows: &BTreeMap<String, Conversation>) {
        match self {
            View::List(filter, tx) => {
                tx.send_replace(select(rows, filter));
            }
            View::Count(filter, tx) => {
                tx.send_replace(rows.values().filter(|c| filter.matches(c)).count());
            }
        }
    }
}

/// Most recent activity first.
fn select(rows: &BTreeMap<String, Conversation>, filter: &ConversationFilter) -> Vec<Conversation> {
    let mut out: Vec<Conversation> = rows.values().filter(|c| filter.matches(c)).cloned().collect();
    out.sort_by(|a, b| {
        b.last_activity_at
            .cmp(&a.last_activity_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    out
}

#[derive(Default)]
struct Inner {
    rows: BTreeMap<String, Conversation>,
    views: Vec<View>,
}

impl Inner {
    fn refresh(&mut self) {
        self.views.retain(|v| !v.is_closed());
        for view in &self.views {
            view.refresh(&self.rows);
        }
    }
}

/// In-process repository keyed by conversation id.
#[derive(Default)]
pub struct MemoryConversations {
    inner: Mutex<Inner>,
}

impl MemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(g) => g,
            Err(poison) => poison.into_inner(),
        }
    }

    pub fn upsert(&self, conversation: Conversation) {
        let mut inner = self.lock();
        inner.rows.insert(conversation.id.clone(), conversation);
        inner.refresh();
    }

    pub fn remove(&self, conversation_id: &str) {
        let mut inner = self.lock();
        if inner.rows.remove(conversation_id).is_some() {
            inner.refresh();
        }
    }
}

impl ConversationsRepository for MemoryConversations {
    fn conversations(&self, filter: ConversationFilter) -> watch::Receiver<Vec<Conversation>> {
        let mut inner = self.lock();
        let (tx, rx) = watch::channel(select(&inner.rows, &filter));
        inner.views.push(View::List(filter, tx));
        rx
    }

    fn count(&self, filter: ConversationFilter) -> watch::Receiver<usize> {
        let mut inner = self.lock();
        let initial = inner.rows.values().filter(|c| filter.matches(c)).count();
        let (tx, rx) = watch::channel(initial);
        inner.views.push(View::Count(filter, tx));
        rx
    }

    fn remove_inbox(&self, inbox_id: &str) {
        let mut inner = self.lock();
        let before = inner.rows.len();
        inner.rows.retain(|_, c| c.inbox_id != inbox_id);
        if inner.rows.len() != before {
            inner.refresh();
        }
    }

    fn clear(&self) {
        let mut inner = self.lock();
        inner.rows.clear();
        inner.refresh();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn convo(id: &str, inbox: &str, kind: ConversationKind, consent: ConsentState, at: i64) -> Conversation {
        Conversation {
            id: id.into(),
            inbox_id: inbox.into(),
            kind,
            consent,
            name: None,
            last_activity_at: at,
        }
    }

    #[test]
    fn filtered_view_is_sorted_and_live() {
        let repo = MemoryConversations::new();
        repo.upsert(convo("c1", "a", ConversationKind::Group, ConsentState::Allowed, 1));
        repo.upsert(convo("c2", "a", ConversationKind::Dm, ConsentState::Allowed, 5));
        repo.upsert(convo("c3", "b", ConversationKind::Group, ConsentState::Denied, 9));

        let allowed = repo.conversations(ConversationFilter::with_consent([ConsentState::Allowed]));
        let ids: Vec<_> = allowed.borrow().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);

        repo.upsert(convo("c4", "b", ConversationKind::Group, ConsentState::Allowed, 7));
        let ids: Vec<_> = allowed.borrow().iter().map(|c| c.id.clone()).collect();
        assert_eq!(ids, vec!["c4", "c2", "c1"]);
    }

    #[test]
    fn counts_follow_kind_filter_and_inbox_removal() {
        let repo = MemoryConversations::new();
        repo.upsert(convo("c1", "a", ConversationKind::Group, ConsentState::Unknown, 1));
        repo.upsert(convo("c2", "b", ConversationKind::Group, ConsentState::Allowed, 2));
        repo.upsert(convo("c3", "b", ConversationKind::Dm, ConsentState::Allowed, 3));

        let groups = repo.count(ConversationFilter::default().kind(ConversationKind::Group));
        assert_eq!(*groups.borrow(), 2);

        repo.remove_inbox("b");
        assert_eq!(*groups.borrow(), 1);

        repo.clear();
        assert_eq!(*groups.borrow(), 0);
    }

    #[test]
    fn dropped_views_are_pruned() {
        let repo = MemoryConversations::new();
        let rx = repo.count(ConversationFilter::default());
        drop(rx);
        repo.upsert(convo("c1", "a", ConversationKind::Dm, ConsentState::Allowed, 1));
        assert!(repo.lock().views.is_empty());
    }
}
