use std::{
    cell::{Cell, RefCell},
    rc::{Rc, Weak},
};

use slotmap::SlotMap;

use crate::{
    query_observer::{ListenerKey, ObserverOptions, QueryObserver},
    query_result::QueryObserverResult,
    QueryClient, QueryError, QueryValue, SelectedValue,
};

/// Reduces the ordered member results to one value.
pub type CombineFn<S, C> = Rc<dyn Fn(&[QueryObserverResult<S>]) -> C>;

struct Member<V, S> {
    hash: String,
    observer: QueryObserver<V, S>,
    listener: Option<ListenerKey>,
}

enum Planned<V, S> {
    Reuse(usize, ObserverOptions<V, S>),
    Add(Member<V, S>),
}

/// Observes a dynamic list of queries as one unit.
///
/// Members are matched to new option lists by query hash, so reordering or inserting
/// queries keeps the observers of unchanged keys. Listeners receive the combined
/// value at most once per notification batch.
pub struct QueriesObserver<V, S = V, C = Vec<QueryObserverResult<S>>> {
    inner: Rc<QueriesInner<V, S, C>>,
}

impl<V, S, C> Clone for QueriesObserver<V, S, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct QueriesInner<V, S, C> {
    this: Weak<QueriesInner<V, S, C>>,
    client: QueryClient,
    members: RefCell<Vec<Member<V, S>>>,
    results: RefCell<Vec<QueryObserverResult<S>>>,
    combine: RefCell<CombineFn<S, C>>,
    // Last combine input and output; recomputed only when either side changed.
    combined: RefCell<Option<(Vec<QueryObserverResult<S>>, *const (), C)>>,
    listeners: RefCell<SlotMap<ListenerKey, Rc<dyn Fn(&C)>>>,
    notify_pending: Cell<bool>,
}

impl<V: QueryValue, S: SelectedValue> QueriesObserver<V, S> {
    /// Observes `queries`, exposing the member results as they are.
    pub fn new(client: &QueryClient, queries: Vec<ObserverOptions<V, S>>) -> Result<Self, QueryError> {
        Self::with_combine(client, queries, |results: &[QueryObserverResult<S>]| results.to_vec())
    }
}

impl<V: QueryValue, S: SelectedValue, C: Clone + 'static> QueriesObserver<V, S, C> {
    /// Observes `queries`, reducing the member results with `combine`.
    pub fn with_combine(
        client: &QueryClient,
        queries: Vec<ObserverOptions<V, S>>,
        combine: impl Fn(&[QueryObserverResult<S>]) -> C + 'static,
    ) -> Result<Self, QueryError> {
        let inner = Rc::new_cyclic(|this| QueriesInner {
            this: this.clone(),
            client: client.clone(),
            members: RefCell::new(Vec::new()),
            results: RefCell::new(Vec::new()),
            combine: RefCell::new(Rc::new(combine)),
            combined: RefCell::new(None),
            listeners: RefCell::new(SlotMap::with_key()),
            notify_pending: Cell::new(false),
        });
        inner.set_queries(queries)?;
        Ok(Self { inner })
    }

    /// Registers a listener. The first one subscribes every member.
    pub fn subscribe(&self, listener: impl Fn(&C) + 'static) -> ListenerKey {
        let (key, first) = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let key = listeners.insert(Rc::new(listener));
            (key, listeners.len() == 1)
        };
        if first {
            let members: Vec<_> = (0..self.inner.members.borrow().len()).collect();
            for index in members {
                self.inner.subscribe_member(index);
            }
        }
        key
    }

    /// Removes a listener. The last one unsubscribes every member.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        let (removed, empty) = {
            let mut listeners = self.inner.listeners.borrow_mut();
            let removed = listeners.remove(key).is_some();
            (removed, listeners.is_empty())
        };
        if removed && empty {
            self.inner.unsubscribe_members();
        }
        removed
    }

    /// Removes every listener and unsubscribes the members.
    pub fn destroy(&self) {
        self.inner.listeners.borrow_mut().clear();
        self.inner.unsubscribe_members();
    }

    /// Replaces the observed queries.
    pub fn set_queries(&self, queries: Vec<ObserverOptions<V, S>>) -> Result<(), QueryError> {
        self.inner.set_queries(queries)
    }

    /// Replaces the reducer.
    pub fn set_combine(&self, combine: impl Fn(&[QueryObserverResult<S>]) -> C + 'static) {
        *self.inner.combine.borrow_mut() = Rc::new(combine);
    }

    /// The member results in option order.
    pub fn get_results(&self) -> Vec<QueryObserverResult<S>> {
        self.inner.results.borrow().clone()
    }

    /// The combined value of the current member results.
    pub fn get_current_result(&self) -> C {
        self.inner.combined()
    }

    /// The member observers in option order.
    pub fn get_observers(&self) -> Vec<QueryObserver<V, S>> {
        self.inner
            .members
            .borrow()
            .iter()
            .map(|member| member.observer.clone())
            .collect()
    }
}

impl<V: QueryValue, S: SelectedValue, C: Clone + 'static> QueriesInner<V, S, C> {
    fn has_listeners(&self) -> bool {
        !self.listeners.borrow().is_empty()
    }

    fn set_queries(&self, queries: Vec<ObserverOptions<V, S>>) -> Result<(), QueryError> {
        // Plan first: nothing is committed until every new observer is built.
        let mut claimed = vec![false; self.members.borrow().len()];
        let mut plan = Vec::with_capacity(queries.len());
        for options in queries {
            let hash = self
                .client
                .default_query_options(options.query.clone())
                .query_hash;
            let existing = self
                .members
                .borrow()
                .iter()
                .zip(&claimed)
                .position(|(member, claimed)| !*claimed && member.hash == hash);
            match existing {
                Some(index) => {
                    claimed[index] = true;
                    plan.push(Planned::Reuse(index, options));
                }
                None => {
                    let observer = QueryObserver::new(&self.client, options)?;
                    plan.push(Planned::Add(Member {
                        hash,
                        observer,
                        listener: None,
                    }));
                }
            }
        }

        self.client
            .environment()
            .notify
            .batch(|| self.commit(plan, &claimed))
    }

    fn commit(&self, plan: Vec<Planned<V, S>>, claimed: &[bool]) -> Result<(), QueryError> {
        let mut previous: Vec<Option<Member<V, S>>> =
            self.members.borrow_mut().drain(..).map(Some).collect();
        let mut next = Vec::with_capacity(plan.len());
        let mut added = Vec::new();
        let mut first_error = None;

        for planned in plan {
            match planned {
                Planned::Reuse(index, options) => {
                    let Some(member) = previous.get_mut(index).and_then(Option::take) else {
                        continue;
                    };
                    if let Err(error) = member.observer.set_options(options) {
                        first_error.get_or_insert(error);
                    }
                    next.push(member);
                }
                Planned::Add(member) => {
                    added.push(next.len());
                    next.push(member);
                }
            }
        }

        let dropped = claimed.iter().filter(|claimed| !**claimed).count();
        for member in previous.into_iter().flatten() {
            if let Some(key) = member.listener {
                member.observer.unsubscribe(key);
            }
        }

        tracing::trace!(count = next.len(), added = added.len(), dropped, "queries observer updated");
        *self.members.borrow_mut() = next;
        if self.has_listeners() {
            for index in added {
                self.subscribe_member(index);
            }
        }
        self.update_results();
        first_error.map_or(Ok(()), Err)
    }

    fn subscribe_member(&self, index: usize) {
        let observer = match self.members.borrow().get(index) {
            Some(member) if member.listener.is_none() => member.observer.clone(),
            _ => return,
        };
        let this = self.this.clone();
        let key = observer.subscribe(move |_| {
            if let Some(inner) = this.upgrade() {
                inner.update_results();
            }
        });
        if let Some(member) = self.members.borrow_mut().get_mut(index) {
            member.listener = Some(key);
        }
        self.update_results();
    }

    fn unsubscribe_members(&self) {
        let subscribed: Vec<_> = self
            .members
            .borrow_mut()
            .iter_mut()
            .filter_map(|member| {
                member
                    .listener
                    .take()
                    .map(|key| (member.observer.clone(), key))
            })
            .collect();
        for (observer, key) in subscribed {
            observer.unsubscribe(key);
        }
    }

    fn update_results(&self) {
        let next: Vec<_> = self
            .members
            .borrow()
            .iter()
            .map(|member| member.observer.get_current_result())
            .collect();
        if *self.results.borrow() == next {
            return;
        }
        *self.results.borrow_mut() = next;
        self.notify();
    }

    fn combined(&self) -> C {
        let results = self.results.borrow().clone();
        let combine = self.combine.borrow().clone();
        let combine_ptr = Rc::as_ptr(&combine) as *const ();
        if let Some((input, ptr, output)) = self.combined.borrow().as_ref() {
            if *ptr == combine_ptr && *input == results {
                return output.clone();
            }
        }
        let output = combine(&results);
        *self.combined.borrow_mut() = Some((results, combine_ptr, output.clone()));
        output
    }

    fn notify(&self) {
        if !self.has_listeners() || self.notify_pending.replace(true) {
            return;
        }
        let this = self.this.clone();
        self.client.environment().notify.schedule(move || {
            if let Some(inner) = this.upgrade() {
                inner.notify_pending.set(false);
                let combined = inner.combined();
                let listeners: Vec<_> = inner.listeners.borrow().values().cloned().collect();
                for listener in listeners {
                    listener(&combined);
                }
            }
        });
    }
}
