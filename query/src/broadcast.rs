use std::{cell::Cell, rc::Rc};

use serde::{Deserialize, Serialize};

use crate::{
    cache_observer::QueryCacheEvent,
    hydration::DehydratedQueryState,
    query_cache::CacheObserverKey,
    query_client::WeakQueryClient,
    query_state::ActionKind,
    QueryClient, QueryError, QueryKey,
};

/// A cache change shared between clients, e.g. across tabs or processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BroadcastMessage {
    /// A query received new data.
    #[serde(rename_all = "camelCase")]
    QueryUpdated {
        /// Canonical hash.
        query_hash: String,
        /// Key.
        query_key: QueryKey,
        /// The new state.
        state: DehydratedQueryState,
    },
    /// A query was removed.
    #[serde(rename_all = "camelCase")]
    QueryRemoved {
        /// Canonical hash.
        query_hash: String,
        /// Key.
        query_key: QueryKey,
    },
}

impl BroadcastMessage {
    /// Encodes the message as JSON.
    pub fn to_json(&self) -> Result<String, QueryError> {
        serde_json::to_string(self).map_err(QueryError::serialization)
    }

    /// Decodes a message from JSON.
    pub fn from_json(json: &str) -> Result<Self, QueryError> {
        serde_json::from_str(json).map_err(QueryError::serialization)
    }
}

/// Outgoing side of a transport between clients.
pub trait BroadcastChannel {
    /// Sends `message` to every other client.
    fn post_message(&self, message: BroadcastMessage);
}

/// Forwards successful updates and removals of `client` to `channel`.
///
/// Incoming messages are applied with [`BroadcastHandle::receive`]. Changes made while
/// applying them are not sent back.
pub fn broadcast_query_client(client: &QueryClient, channel: Rc<dyn BroadcastChannel>) -> BroadcastHandle {
    let transaction = Rc::new(Cell::new(false));
    let key = client.query_cache().subscribe({
        let transaction = transaction.clone();
        move |event: QueryCacheEvent| {
            if transaction.get() {
                return;
            }
            let message = match &event {
                QueryCacheEvent::Updated {
                    query,
                    action: ActionKind::Success,
                } => match query.dehydrate() {
                    Ok(dehydrated) => BroadcastMessage::QueryUpdated {
                        query_hash: dehydrated.query_hash,
                        query_key: dehydrated.query_key,
                        state: dehydrated.state,
                    },
                    Err(error) => {
                        tracing::warn!(query_hash = %query.query_hash(), %error, "failed to broadcast query");
                        return;
                    }
                },
                QueryCacheEvent::Removed(query) => BroadcastMessage::QueryRemoved {
                    query_hash: query.query_hash().to_string(),
                    query_key: query.query_key().clone(),
                },
                _ => return,
            };
            channel.post_message(message);
        }
    });
    BroadcastHandle {
        client: client.downgrade(),
        transaction,
        key,
    }
}

/// Keeps a client connected to a channel. Dropping it stops broadcasting.
#[must_use = "dropping the handle stops broadcasting"]
pub struct BroadcastHandle {
    client: WeakQueryClient,
    transaction: Rc<Cell<bool>>,
    key: CacheObserverKey,
}

impl BroadcastHandle {
    /// Applies a message sent by another client.
    ///
    /// Updates for queries this client has not built yet are kept until the query is built.
    pub fn receive(&self, message: BroadcastMessage) -> Result<(), QueryError> {
        let Some(client) = self.client.upgrade() else {
            return Ok(());
        };
        let cache = client.query_cache();
        self.transaction.set(true);
        let result = match message {
            BroadcastMessage::QueryUpdated {
                query_hash,
                query_key,
                state,
            } => match cache.get(&query_hash) {
                Some(query) => query.hydrate(&state, false),
                None => {
                    cache.stash(crate::hydration::DehydratedQuery {
                        query_hash,
                        query_key,
                        state,
                        meta: None,
                    });
                    Ok(())
                }
            },
            BroadcastMessage::QueryRemoved { query_hash, .. } => {
                if let Some(query) = cache.get(&query_hash) {
                    cache.remove(query.as_ref());
                }
                cache.unstash(&query_hash);
                Ok(())
            }
        };
        self.transaction.set(false);
        result
    }

    /// Stops broadcasting.
    pub fn close(self) {}
}

impl Drop for BroadcastHandle {
    fn drop(&mut self) {
        if let Some(client) = self.client.upgrade() {
            client.query_cache().unsubscribe(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::{query_state::QueryStatus, test_util::run_local, QueryOptions};

    #[derive(Default)]
    struct Outbox(RefCell<Vec<BroadcastMessage>>);

    impl BroadcastChannel for Outbox {
        fn post_message(&self, message: BroadcastMessage) {
            self.0.borrow_mut().push(message);
        }
    }

    #[test]
    fn message_json_is_tagged() {
        let message = BroadcastMessage::QueryRemoved {
            query_hash: "[\"a\"]".into(),
            query_key: QueryKey::from("a"),
        };
        let json: serde_json::Value = serde_json::from_str(&message.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "queryRemoved");
        assert_eq!(json["queryHash"], "[\"a\"]");
        assert_eq!(BroadcastMessage::from_json(&json.to_string()).unwrap(), message);
    }

    #[tokio::test(start_paused = true)]
    async fn updates_travel_between_clients_without_echo() {
        run_local(async {
            let left = QueryClient::default();
            let right = QueryClient::default();
            let left_out = Rc::new(Outbox::default());
            let right_out = Rc::new(Outbox::default());
            let _left_handle = broadcast_query_client(&left, left_out.clone());
            let right_handle = broadcast_query_client(&right, right_out.clone());

            right.set_query_data("todos", 1_u32).unwrap();
            left.set_query_data("todos", 2_u32).unwrap();
            let sent = left_out.0.borrow_mut().drain(..).collect::<Vec<_>>();
            assert_eq!(sent.len(), 1);
            right_out.0.borrow_mut().clear();

            for message in sent {
                right_handle.receive(message).unwrap();
            }
            assert_eq!(right.get_query_data::<u32>(&QueryKey::from("todos")), Some(2));
            assert_eq!(
                right.get_query_state::<u32>(&QueryKey::from("todos")).map(|state| state.status),
                Some(QueryStatus::Success)
            );
            assert!(right_out.0.borrow().is_empty());

            left.remove_queries(&crate::QueryFilters::key("todos"));
            let sent = left_out.0.borrow_mut().drain(..).collect::<Vec<_>>();
            assert!(matches!(sent.as_slice(), [BroadcastMessage::QueryRemoved { .. }]));
            for message in sent {
                right_handle.receive(message).unwrap();
            }
            assert!(right.query_cache().get_all().is_empty());
            assert!(right_out.0.borrow().is_empty());
        })
        .await;
    }

    #[tokio::test(start_paused = true)]
    async fn updates_for_unknown_queries_wait_for_build() {
        run_local(async {
            let client = QueryClient::default();
            let handle = broadcast_query_client(&client, Rc::new(Outbox::default()));
            let source = QueryClient::default();
            source.set_query_data("later", 9_u32).unwrap();
            let Some(query) = source.query_cache().get_all().pop() else {
                panic!("query missing");
            };
            let dehydrated = query.dehydrate().unwrap();
            handle
                .receive(BroadcastMessage::QueryUpdated {
                    query_hash: dehydrated.query_hash,
                    query_key: dehydrated.query_key,
                    state: dehydrated.state,
                })
                .unwrap();

            let options = client.default_query_options(QueryOptions::<u32>::new("later"));
            let query = client.query_cache().build(options).unwrap();
            assert_eq!(query.data(), Some(9));
        })
        .await;
    }
}
