use std::{fmt, future::Future, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt};

use crate::{
    query_options::{GcTime, Meta, NetworkMode, Retry, RetryDelay},
    FetchError, QueryKey,
};

/// Runs a mutation with its variables.
pub type MutationFn<D, Vars> = Rc<dyn Fn(Vars) -> LocalBoxFuture<'static, Result<D, FetchError>>>;

/// Runs before the mutation function. Its output is handed to the other callbacks,
/// typically to roll back an optimistic update.
pub type OnMutate<Vars, Ctx> = Rc<dyn Fn(Vars) -> LocalBoxFuture<'static, Result<Ctx, FetchError>>>;

/// Client-wide mutation defaults.
#[derive(Debug, Clone)]
pub struct DefaultMutationOptions {
    /// Retry policy. Mutations do not retry by default.
    pub retry: Retry,
    /// Delay between attempts.
    pub retry_delay: RetryDelay,
    /// Behavior while offline.
    pub network_mode: NetworkMode,
    /// Time before an unobserved, settled mutation is removed from cache.
    pub gc_time: GcTime,
    /// Metadata.
    pub meta: Option<Meta>,
}

impl Default for DefaultMutationOptions {
    fn default() -> Self {
        Self {
            retry: Retry::Never,
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::default(),
            gc_time: GcTime::default(),
            meta: None,
        }
    }
}

/// Partial mutation defaults. Unset fields fall back to the next layer.
#[derive(Debug, Clone, Default)]
pub struct MutationOverrides {
    /// Retry policy.
    pub retry: Option<Retry>,
    /// Delay between attempts.
    pub retry_delay: Option<RetryDelay>,
    /// Behavior while offline.
    pub network_mode: Option<NetworkMode>,
    /// Time before an unobserved, settled mutation is removed from cache.
    pub gc_time: Option<GcTime>,
    /// Metadata.
    pub meta: Option<Meta>,
}

impl MutationOverrides {
    /// Writes every set field over `defaults`.
    pub fn apply_to(&self, defaults: &mut DefaultMutationOptions) {
        if let Some(retry) = &self.retry {
            defaults.retry = retry.clone();
        }
        if let Some(retry_delay) = &self.retry_delay {
            defaults.retry_delay = retry_delay.clone();
        }
        if let Some(network_mode) = self.network_mode {
            defaults.network_mode = network_mode;
        }
        if let Some(gc_time) = self.gc_time {
            defaults.gc_time = gc_time;
        }
        if let Some(meta) = &self.meta {
            defaults.meta = Some(meta.clone());
        }
    }
}

/// Options of a mutation.
pub struct MutationOptions<D, Vars, Ctx = ()> {
    /// Optional key, used by filters and per-key defaults.
    pub mutation_key: Option<QueryKey>,
    /// Performs the mutation.
    pub mutation_fn: Option<MutationFn<D, Vars>>,
    /// Untyped overrides of the client defaults.
    pub overrides: MutationOverrides,
    /// Mutations sharing a scope run one after another, in submission order.
    pub scope: Option<String>,
    /// Runs before the mutation function.
    pub on_mutate: Option<OnMutate<Vars, Ctx>>,
    /// Runs after a successful mutation.
    pub on_success: Option<Rc<dyn Fn(&D, &Vars, Option<&Ctx>)>>,
    /// Runs after a failed mutation.
    pub on_error: Option<Rc<dyn Fn(&FetchError, &Vars, Option<&Ctx>)>>,
    /// Runs after the mutation settled either way.
    pub on_settled: Option<Rc<dyn Fn(Option<&D>, Option<&FetchError>, &Vars, Option<&Ctx>)>>,
}

impl<D, Vars, Ctx> Clone for MutationOptions<D, Vars, Ctx> {
    fn clone(&self) -> Self {
        Self {
            mutation_key: self.mutation_key.clone(),
            mutation_fn: self.mutation_fn.clone(),
            overrides: self.overrides.clone(),
            scope: self.scope.clone(),
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

impl<D, Vars, Ctx> Default for MutationOptions<D, Vars, Ctx> {
    fn default() -> Self {
        Self {
            mutation_key: None,
            mutation_fn: None,
            overrides: MutationOverrides::default(),
            scope: None,
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }
}

impl<D, Vars, Ctx> fmt::Debug for MutationOptions<D, Vars, Ctx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("overrides", &self.overrides)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}

impl<D: 'static, Vars: 'static, Ctx: 'static> MutationOptions<D, Vars, Ctx> {
    /// Options running `func`.
    pub fn new<F, Fu>(func: F) -> Self
    where
        F: Fn(Vars) -> Fu + 'static,
        Fu: Future<Output = Result<D, FetchError>> + 'static,
    {
        Self {
            mutation_fn: Some(Rc::new(move |variables| func(variables).boxed_local())),
            ..Self::default()
        }
    }

    /// Set the mutation key.
    pub fn set_mutation_key(mut self, key: impl Into<QueryKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    /// Set the scope id.
    pub fn set_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Set the retry policy.
    pub fn set_retry(mut self, retry: impl Into<Retry>) -> Self {
        self.overrides.retry = Some(retry.into());
        self
    }

    /// Set the delay between attempts.
    pub fn set_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.overrides.retry_delay = Some(retry_delay);
        self
    }

    /// Set the network mode.
    pub fn set_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.overrides.network_mode = Some(network_mode);
        self
    }

    /// Set the gc time.
    pub fn set_gc_time(mut self, gc_time: impl Into<GcTime>) -> Self {
        self.overrides.gc_time = Some(gc_time.into());
        self
    }

    /// Set the metadata.
    pub fn set_meta(mut self, meta: Meta) -> Self {
        self.overrides.meta = Some(meta);
        self
    }

    /// Set the callback running before the mutation function.
    pub fn set_on_mutate<F, Fu>(mut self, func: F) -> Self
    where
        F: Fn(Vars) -> Fu + 'static,
        Fu: Future<Output = Result<Ctx, FetchError>> + 'static,
    {
        self.on_mutate = Some(Rc::new(move |variables| func(variables).boxed_local()));
        self
    }

    /// Set the success callback.
    pub fn set_on_success(mut self, func: impl Fn(&D, &Vars, Option<&Ctx>) + 'static) -> Self {
        self.on_success = Some(Rc::new(func));
        self
    }

    /// Set the error callback.
    pub fn set_on_error(mut self, func: impl Fn(&FetchError, &Vars, Option<&Ctx>) + 'static) -> Self {
        self.on_error = Some(Rc::new(func));
        self
    }

    /// Set the settled callback.
    pub fn set_on_settled(
        mut self,
        func: impl Fn(Option<&D>, Option<&FetchError>, &Vars, Option<&Ctx>) + 'static,
    ) -> Self {
        self.on_settled = Some(Rc::new(func));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mutations_do_not_retry_by_default() {
        let defaults = DefaultMutationOptions::default();
        assert!(matches!(defaults.retry, Retry::Never));
    }

    #[test]
    fn overrides_replace_only_set_fields() {
        let mut defaults = DefaultMutationOptions::default();
        MutationOverrides {
            retry: Some(Retry::Count(2)),
            network_mode: Some(NetworkMode::Always),
            ..MutationOverrides::default()
        }
        .apply_to(&mut defaults);
        assert!(matches!(defaults.retry, Retry::Count(2)));
        assert_eq!(defaults.network_mode, NetworkMode::Always);
        assert_eq!(defaults.gc_time, GcTime::default());
    }
}
