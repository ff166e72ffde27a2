//! Paginated queries: the cached value is a list of pages fetched one at a time.

use std::{fmt, rc::Rc};

use futures::{future::LocalBoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    query::FetchOptions,
    query_observer::{ListenerKey, QueryObserver, WeakQueryObserver},
    query_options::{Meta, QueryOptions},
    query_result::QueryObserverResult,
    query_state::{FetchDirection, FetchMeta, FetchStatus, QueryState},
    retryer::CancelSignal,
    structural::StructuralShare,
    FetchError, QueryClient, QueryError, QueryKey, QueryValue,
};

/// Everything a [`QueryBehavior`] sees when a fetch starts.
#[derive(Clone)]
pub struct FetchContext<V> {
    /// Key of the query being fetched.
    pub query_key: QueryKey,
    /// State of the query when the fetch started.
    pub state: QueryState<V>,
    /// Extra information passed by the caller, e.g. the page direction.
    pub fetch_meta: Option<FetchMeta>,
    /// Set once the fetch is cancelled.
    pub signal: CancelSignal,
    /// The query's meta.
    pub meta: Option<Meta>,
}

/// Replaces the plain query function call with a custom fetch strategy.
pub trait QueryBehavior<V> {
    /// Produces the next value of the query.
    fn on_fetch(&self, context: FetchContext<V>) -> LocalBoxFuture<'static, Result<V, FetchError>>;
}

/// Bounds of a page parameter.
pub trait PageParam: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + 'static {}

impl<P> PageParam for P where P: Clone + PartialEq + fmt::Debug + Serialize + DeserializeOwned + 'static {}

/// Pages of an infinite query with the parameter each was fetched with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfiniteData<T, P> {
    /// Fetched pages, first to last.
    pub pages: Vec<T>,
    /// `page_params[i]` produced `pages[i]`.
    pub page_params: Vec<P>,
}

impl<T, P> Default for InfiniteData<T, P> {
    fn default() -> Self {
        Self {
            pages: Vec::new(),
            page_params: Vec::new(),
        }
    }
}

impl<T, P> InfiniteData<T, P> {
    /// Whether no page was fetched yet.
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }
}

impl<T: StructuralShare, P: Clone + PartialEq> StructuralShare for InfiniteData<T, P> {
    fn replace_equal_deep(prev: &Self, next: Self) -> Self {
        let page_params = if prev.page_params == next.page_params {
            prev.page_params.clone()
        } else {
            next.page_params
        };
        Self {
            pages: Vec::replace_equal_deep(&prev.pages, next.pages),
            page_params,
        }
    }
}

/// Passed to the page function.
#[derive(Clone)]
pub struct PageContext<P> {
    /// Key of the infinite query.
    pub query_key: QueryKey,
    /// Parameter of the requested page.
    pub page_param: P,
    /// Set when a single page is added before or after the loaded ones.
    pub direction: Option<FetchDirection>,
    /// Set once the fetch is cancelled.
    pub signal: CancelSignal,
    /// The query's meta.
    pub meta: Option<Meta>,
}

/// Fetches one page.
pub type PageFn<T, P> = Rc<dyn Fn(PageContext<P>) -> LocalBoxFuture<'static, Result<T, FetchError>>>;

/// Computes the parameter of the page after the last one (or before the first one).
/// `None` means there is no such page.
pub type GetPageParam<T, P> = Rc<dyn Fn(&InfiniteData<T, P>) -> Option<P>>;

struct InfiniteBehavior<T, P> {
    page_fn: PageFn<T, P>,
    initial_page_param: P,
    get_next_page_param: GetPageParam<T, P>,
    get_previous_page_param: Option<GetPageParam<T, P>>,
    max_pages: Option<usize>,
}

impl<T, P> Clone for InfiniteBehavior<T, P>
where
    P: Clone,
{
    fn clone(&self) -> Self {
        Self {
            page_fn: self.page_fn.clone(),
            initial_page_param: self.initial_page_param.clone(),
            get_next_page_param: self.get_next_page_param.clone(),
            get_previous_page_param: self.get_previous_page_param.clone(),
            max_pages: self.max_pages,
        }
    }
}

impl<T: QueryValue, P: PageParam> InfiniteBehavior<T, P> {
    fn has_next_page(&self, data: &InfiniteData<T, P>) -> bool {
        !data.is_empty() && (self.get_next_page_param)(data).is_some()
    }

    fn has_previous_page(&self, data: &InfiniteData<T, P>) -> bool {
        !data.is_empty()
            && self
                .get_previous_page_param
                .as_ref()
                .is_some_and(|get| get(data).is_some())
    }

    fn page_context(&self, context: &FetchContext<InfiniteData<T, P>>, page_param: P) -> PageContext<P> {
        PageContext {
            query_key: context.query_key.clone(),
            page_param,
            direction: context.fetch_meta.and_then(|meta| meta.direction),
            signal: context.signal.clone(),
            meta: context.meta.clone(),
        }
    }

    async fn fetch_page(
        &self,
        context: &FetchContext<InfiniteData<T, P>>,
        mut data: InfiniteData<T, P>,
        page_param: P,
        direction: FetchDirection,
    ) -> Result<InfiniteData<T, P>, FetchError> {
        let page = (self.page_fn)(self.page_context(context, page_param.clone())).await?;
        match direction {
            FetchDirection::Forward => {
                data.pages.push(page);
                data.page_params.push(page_param);
                if let Some(max) = self.max_pages.filter(|max| data.pages.len() > *max) {
                    let excess = data.pages.len() - max;
                    data.pages.drain(..excess);
                    data.page_params.drain(..excess);
                }
            }
            FetchDirection::Backward => {
                data.pages.insert(0, page);
                data.page_params.insert(0, page_param);
                if let Some(max) = self.max_pages {
                    data.pages.truncate(max);
                    data.page_params.truncate(max);
                }
            }
        }
        Ok(data)
    }

    async fn run(&self, context: FetchContext<InfiniteData<T, P>>) -> Result<InfiniteData<T, P>, FetchError> {
        let old = context.state.data.clone().unwrap_or_default();
        let direction = context.fetch_meta.and_then(|meta| meta.direction);

        if let (Some(direction), false) = (direction, old.is_empty()) {
            let param = match direction {
                FetchDirection::Forward => (self.get_next_page_param)(&old),
                FetchDirection::Backward => self.get_previous_page_param.as_ref().and_then(|get| get(&old)),
            };
            return match param {
                Some(param) => self.fetch_page(&context, old, param, direction).await,
                None => Ok(old),
            };
        }

        // Refetch every loaded page, starting over from the first parameter.
        let first_param = old
            .page_params
            .first()
            .cloned()
            .unwrap_or_else(|| self.initial_page_param.clone());
        let mut data = self
            .fetch_page(&context, InfiniteData::default(), first_param, FetchDirection::Forward)
            .await?;
        for _ in 1..old.pages.len() {
            let Some(param) = (self.get_next_page_param)(&data) else {
                break;
            };
            data = self
                .fetch_page(&context, data, param, FetchDirection::Forward)
                .await?;
        }
        Ok(data)
    }
}

impl<T: QueryValue, P: PageParam> QueryBehavior<InfiniteData<T, P>> for InfiniteBehavior<T, P> {
    fn on_fetch(
        &self,
        context: FetchContext<InfiniteData<T, P>>,
    ) -> LocalBoxFuture<'static, Result<InfiniteData<T, P>, FetchError>> {
        let behavior = self.clone();
        async move { behavior.run(context).await }.boxed_local()
    }
}

/// Options of an infinite query.
pub struct InfiniteQueryOptions<T, P> {
    /// Options of the underlying query. Its query function is ignored.
    pub options: QueryOptions<InfiniteData<T, P>>,
    behavior: InfiniteBehavior<T, P>,
}

impl<T: QueryValue, P: PageParam> InfiniteQueryOptions<T, P> {
    /// An infinite query starting at `initial_page_param`.
    pub fn new<F, Fu>(
        query_key: impl Into<QueryKey>,
        page_fn: F,
        initial_page_param: P,
        get_next_page_param: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static,
    ) -> Self
    where
        F: Fn(PageContext<P>) -> Fu + 'static,
        Fu: std::future::Future<Output = Result<T, FetchError>> + 'static,
    {
        Self {
            options: QueryOptions::new(query_key),
            behavior: InfiniteBehavior {
                page_fn: Rc::new(move |context| page_fn(context).boxed_local()),
                initial_page_param,
                get_next_page_param: Rc::new(get_next_page_param),
                get_previous_page_param: None,
                max_pages: None,
            },
        }
    }

    /// Enables fetching pages before the first one.
    pub fn set_get_previous_page_param(
        mut self,
        get_previous_page_param: impl Fn(&InfiniteData<T, P>) -> Option<P> + 'static,
    ) -> Self {
        self.behavior.get_previous_page_param = Some(Rc::new(get_previous_page_param));
        self
    }

    /// Caps the number of pages kept. Adding a page drops one from the other end.
    pub fn set_max_pages(mut self, max_pages: usize) -> Self {
        self.behavior.max_pages = Some(max_pages.max(1));
        self
    }

    /// Adjusts the underlying query options.
    pub fn map_options(
        mut self,
        func: impl FnOnce(QueryOptions<InfiniteData<T, P>>) -> QueryOptions<InfiniteData<T, P>>,
    ) -> Self {
        self.options = func(self.options);
        self
    }

    /// The query options with the paging behavior attached.
    pub fn into_query_options(self) -> QueryOptions<InfiniteData<T, P>> {
        QueryOptions {
            behavior: Some(Rc::new(self.behavior)),
            ..self.options
        }
    }
}

/// Result of an [`InfiniteQueryObserver`].
#[derive(Debug, Clone, PartialEq)]
pub struct InfiniteQueryObserverResult<T, P> {
    /// The plain observer result.
    pub result: QueryObserverResult<InfiniteData<T, P>>,
    /// Whether a page after the last one exists.
    pub has_next_page: bool,
    /// Whether a page before the first one exists.
    pub has_previous_page: bool,
    /// A next page is being fetched.
    pub is_fetching_next_page: bool,
    /// A previous page is being fetched.
    pub is_fetching_previous_page: bool,
    /// Fetching the next page failed.
    pub is_fetch_next_page_error: bool,
    /// Fetching the previous page failed.
    pub is_fetch_previous_page_error: bool,
}

/// Observes an infinite query and fetches additional pages.
pub struct InfiniteQueryObserver<T, P> {
    observer: QueryObserver<InfiniteData<T, P>>,
    behavior: InfiniteBehavior<T, P>,
}

impl<T: QueryValue, P: PageParam> InfiniteQueryObserver<T, P> {
    /// Creates the observer. It fetches the first page once a listener subscribes.
    pub fn new(client: &QueryClient, options: InfiniteQueryOptions<T, P>) -> Result<Self, QueryError> {
        let behavior = options.behavior.clone();
        let observer = QueryObserver::new(client, options.into_query_options())?;
        Ok(Self { observer, behavior })
    }

    /// The underlying observer.
    pub fn observer(&self) -> &QueryObserver<InfiniteData<T, P>> {
        &self.observer
    }

    /// The current result with paging information.
    pub fn get_current_result(&self) -> InfiniteQueryObserverResult<T, P> {
        extend_result(&self.observer.downgrade(), &self.behavior, self.observer.get_current_result())
    }

    /// Registers a listener.
    pub fn subscribe(&self, listener: impl Fn(&InfiniteQueryObserverResult<T, P>) + 'static) -> ListenerKey {
        let weak = self.observer.downgrade();
        let behavior = self.behavior.clone();
        self.observer.subscribe(move |result| {
            listener(&extend_result(&weak, &behavior, result.clone()));
        })
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, key: ListenerKey) -> bool {
        self.observer.unsubscribe(key)
    }

    /// Appends the page after the last one.
    pub async fn fetch_next_page(&self) -> InfiniteQueryObserverResult<T, P> {
        self.fetch_page(FetchDirection::Forward).await
    }

    /// Prepends the page before the first one.
    pub async fn fetch_previous_page(&self) -> InfiniteQueryObserverResult<T, P> {
        self.fetch_page(FetchDirection::Backward).await
    }

    /// Refetches every loaded page.
    pub async fn refetch(&self) -> InfiniteQueryObserverResult<T, P> {
        let result = self.observer.refetch().await;
        extend_result(&self.observer.downgrade(), &self.behavior, result)
    }

    async fn fetch_page(&self, direction: FetchDirection) -> InfiniteQueryObserverResult<T, P> {
        let result = self
            .observer
            .fetch(FetchOptions {
                cancel_refetch: true,
                meta: Some(FetchMeta {
                    direction: Some(direction),
                }),
            })
            .await;
        extend_result(&self.observer.downgrade(), &self.behavior, result)
    }
}

fn extend_result<T: QueryValue, P: PageParam>(
    observer: &WeakQueryObserver<InfiniteData<T, P>>,
    behavior: &InfiniteBehavior<T, P>,
    result: QueryObserverResult<InfiniteData<T, P>>,
) -> InfiniteQueryObserverResult<T, P> {
    let direction = observer
        .upgrade()
        .and_then(|observer| {
            observer
                .get_current_query()
                .with_state(|state| state.fetch_meta.and_then(|meta| meta.direction))
        });
    let (has_next_page, has_previous_page) = match &result.data {
        Some(data) => (behavior.has_next_page(data), behavior.has_previous_page(data)),
        None => (false, false),
    };
    let fetching = result.fetch_status == FetchStatus::Fetching;
    // A failed page fetch keeps the loaded pages, so the error shows up next to the data.
    let failed = result.error.is_some() && !fetching;
    InfiniteQueryObserverResult {
        has_next_page,
        has_previous_page,
        is_fetching_next_page: fetching && direction == Some(FetchDirection::Forward),
        is_fetching_previous_page: fetching && direction == Some(FetchDirection::Backward),
        is_fetch_next_page_error: failed && direction == Some(FetchDirection::Forward),
        is_fetch_previous_page_error: failed && direction == Some(FetchDirection::Backward),
        result,
    }
}

impl QueryClient {
    /// Fetches an infinite query, resolving to its pages.
    pub async fn fetch_infinite_query<T: QueryValue, P: PageParam>(
        &self,
        options: InfiniteQueryOptions<T, P>,
    ) -> Result<InfiniteData<T, P>, QueryError> {
        self.fetch_query(options.into_query_options()).await
    }
}
