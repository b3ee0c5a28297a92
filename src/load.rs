use std::future::Future;

/// A `Load` maps a single key to a freshly fetched value, used by [`crate::KeyedCache`]
///
/// Implemented for any `Fn(K) -> impl Future<Output = Result<V, E>>`.
pub trait Load<K, V> {
    type Error;

    fn load(&self, key: K) -> impl Future<Output = Result<V, Self::Error>> + Send;
}

impl<K, V, F, Fut, E> Load<K, V> for F
where
    F: Fn(K) -> Fut,
    Fut: Future<Output = Result<V, E>> + Send,
{
    type Error = E;

    fn load(&self, key: K) -> impl Future<Output = Result<V, E>> + Send {
        self(key)
    }
}

/// A `BulkLoad` fetches the whole data set in one call, used by [`crate::BulkCache`]
///
/// Implemented for any `Fn() -> impl Future<Output = Result<Vec<V>, E>>`.
pub trait BulkLoad<V> {
    type Error;

    fn load_all(&self) -> impl Future<Output = Result<Vec<V>, Self::Error>> + Send;
}

impl<V, F, Fut, E> BulkLoad<V> for F
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Vec<V>, E>> + Send,
{
    type Error = E;

    fn load_all(&self) -> impl Future<Output = Result<Vec<V>, E>> + Send {
        self()
    }
}
