//! Presentation-owned call grouping
//!
//! A [`CallGroup`] is an ordered, de-duplicated set of Call-IDs chosen by the
//! user or the flow viewer, plus an optional anchor. Calls are referenced by
//! id and resolved lazily against the store, so a group never keeps an
//! evicted call alive.

use super::call::Call;
use super::message::Message;
use super::Storage;

#[derive(Debug, Clone, Default)]
pub struct CallGroup {
    ids: Vec<String>,
    /// Call the flow view is centred on
    pub anchor: Option<String>,
}

impl CallGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, call: &Call) {
        self.add_id(call.call_id.clone());
    }

    pub fn add_id(&mut self, call_id: String) {
        if !self.ids.contains(&call_id) {
            self.ids.push(call_id);
        }
    }

    pub fn add_calls<'a, I: IntoIterator<Item = &'a Call>>(&mut self, calls: I) {
        for call in calls {
            self.add(call);
        }
    }

    pub fn remove(&mut self, call: &Call) {
        self.ids.retain(|id| id != &call.call_id);
    }

    pub fn contains(&self, call: &Call) -> bool {
        self.ids.iter().any(|id| id == &call.call_id)
    }

    pub fn count(&self) -> usize {
        self.ids.len()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Group messages in merged timestamp order for flow rendering
    ///
    /// With `extended` set, messages of cross-linked calls are merged in as
    /// well (attended-transfer view). Timestamp ties keep arrival order.
    pub fn messages<'a>(&self, storage: &'a Storage, extended: bool) -> Vec<&'a Message> {
        let mut ids: Vec<&str> = self.ids.iter().map(|s| s.as_str()).collect();
        if extended {
            for id in &self.ids {
                if let Some(call) = storage.call(id) {
                    for xcall in &call.xcalls {
                        if !ids.contains(&xcall.as_str()) {
                            ids.push(xcall);
                        }
                    }
                }
            }
        }

        let mut messages: Vec<&Message> = ids
            .iter()
            .filter_map(|id| storage.call(id))
            .flat_map(|call| call.messages().iter())
            .collect();
        messages.sort_by_key(|m| (m.ts_usec(), m.seq));
        messages
    }
}
