//! Method table: the binding between method ids and handlers.
//!
//! Built once at startup from a builder and immutable afterwards. Lookups are
//! a single hash probe on the [`MethodId`] read from the frame. The same table
//! type serves the server (hub methods, context = the request's hub context)
//! and the client (push receivers and client-invoke handlers).
//!
//! Handlers take their arguments as a [`PooledPayload`]; typed handlers
//! registered with [`MethodTableBuilder::method`] decode it with the table's
//! serializer and hand the slot back to the pool before running user code.

use std::{collections::HashMap, fmt, future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use serde::{Serialize, de::DeserializeOwned};
use streamhub_proto::{CborSerializer, MethodId, Serializer};

use crate::{
    error::{MethodError, TableError},
    payload::PooledPayload,
};

/// Future returned by a method handler
pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, MethodError>> + Send>>;

/// Type-erased method implementation.
pub trait MethodHandler<C>: Send + Sync + 'static {
    /// Run the method with the request context and serialized arguments
    fn call(&self, ctx: C, args: PooledPayload) -> HandlerFuture;
}

impl<C, F, Fut> MethodHandler<C> for F
where
    F: Fn(C, PooledPayload) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Bytes, MethodError>> + Send + 'static,
{
    fn call(&self, ctx: C, args: PooledPayload) -> HandlerFuture {
        Box::pin(self(ctx, args))
    }
}

/// One bound method
pub struct MethodEntry<C> {
    id: MethodId,
    name: Arc<str>,
    handler: Arc<dyn MethodHandler<C>>,
}

impl<C> Clone for MethodEntry<C> {
    fn clone(&self) -> Self {
        Self { id: self.id, name: Arc::clone(&self.name), handler: Arc::clone(&self.handler) }
    }
}

impl<C> fmt::Debug for MethodEntry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodEntry").field("id", &self.id).field("name", &self.name).finish()
    }
}

impl<C> MethodEntry<C> {
    /// Method id
    pub fn id(&self) -> MethodId {
        self.id
    }

    /// Method name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start the handler. The returned future owns everything it needs.
    pub fn invoke(&self, ctx: C, args: PooledPayload) -> HandlerFuture
    where
        C: 'static,
    {
        self.handler.call(ctx, args)
    }
}

/// Immutable method id → handler map.
pub struct MethodTable<C> {
    entries: HashMap<MethodId, MethodEntry<C>>,
    by_name: HashMap<Arc<str>, MethodId>,
}

impl<C> fmt::Debug for MethodTable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.entries.iter().map(|(id, entry)| (id, entry.name()))).finish()
    }
}

impl<C> Default for MethodTable<C> {
    fn default() -> Self {
        Self { entries: HashMap::new(), by_name: HashMap::new() }
    }
}

impl<C: Send + 'static> MethodTable<C> {
    /// Start building a table whose typed methods use the CBOR serializer
    pub fn builder() -> MethodTableBuilder<C, CborSerializer> {
        MethodTableBuilder::new(CborSerializer)
    }

    /// Start building a table with a custom serializer
    pub fn builder_with<S: Serializer>(serializer: S) -> MethodTableBuilder<C, S> {
        MethodTableBuilder::new(serializer)
    }

    /// Handler for `id`
    pub fn resolve(&self, id: MethodId) -> Option<&MethodEntry<C>> {
        self.entries.get(&id)
    }

    /// Id bound to `name`
    pub fn resolve_name(&self, name: &str) -> Option<MethodId> {
        self.by_name.get(name).copied()
    }

    /// Number of methods
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no methods
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builder for [`MethodTable`].
///
/// Collisions are reported by [`build`](Self::build), not at registration,
/// so registration calls chain.
pub struct MethodTableBuilder<C, S> {
    serializer: Arc<S>,
    entries: Vec<MethodEntry<C>>,
}

impl<C, S> MethodTableBuilder<C, S>
where
    C: Send + 'static,
    S: Serializer,
{
    fn new(serializer: S) -> Self {
        Self { serializer: Arc::new(serializer), entries: Vec::new() }
    }

    /// Bind a raw handler under the id derived from `name`
    #[must_use]
    pub fn add_raw(self, name: &str, handler: impl MethodHandler<C>) -> Self {
        self.add_raw_with_id(MethodId::from_name(name), name, handler)
    }

    /// Bind a raw handler under an explicit id
    #[must_use]
    pub fn add_raw_with_id(mut self, id: MethodId, name: &str, handler: impl MethodHandler<C>) -> Self {
        self.entries.push(MethodEntry { id, name: Arc::from(name), handler: Arc::new(handler) });
        self
    }

    /// Bind a typed request/response handler.
    ///
    /// Arguments that fail to decode produce `INVALID_ARGUMENT` without
    /// running `f`.
    #[must_use]
    pub fn add<Req, Resp, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(C, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, MethodError>> + Send + 'static,
    {
        let serializer = Arc::clone(&self.serializer);
        let f = Arc::new(f);
        self.add_raw(name, move |ctx: C, args: PooledPayload| {
            let serializer = Arc::clone(&serializer);
            let f = Arc::clone(&f);
            async move {
                let request: Req = decode_args(serializer.as_ref(), args)?;
                let response = f(ctx, request).await?;
                serializer
                    .to_vec(&response)
                    .map(Bytes::from)
                    .map_err(|e| MethodError::internal(format!("failed to encode result: {e}")))
            }
        })
    }

    /// Bind a typed handler without a meaningful result (fire-and-forget
    /// methods and push receivers). The unit result is still encoded, so the
    /// handler can also serve request frames.
    #[must_use]
    pub fn add_fire_and_forget<Req, F, Fut>(self, name: &str, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        F: Fn(C, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MethodError>> + Send + 'static,
    {
        self.add::<Req, (), F, Fut>(name, f)
    }

    /// Serializer used by typed methods
    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Finish the table; fails if two methods share an id.
    pub fn build(self) -> Result<MethodTable<C>, TableError> {
        let mut table = MethodTable::default();
        for entry in self.entries {
            if let Some(existing) = table.entries.get(&entry.id) {
                return Err(TableError::DuplicateMethod {
                    method_id: entry.id,
                    existing: existing.name().to_owned(),
                    name: entry.name().to_owned(),
                });
            }
            table.by_name.insert(Arc::clone(&entry.name), entry.id);
            table.entries.insert(entry.id, entry);
        }
        Ok(table)
    }
}

/// Decode typed arguments and hand the payload slot back to the pool.
pub fn decode_args<S, T>(serializer: &S, args: PooledPayload) -> Result<T, MethodError>
where
    S: Serializer,
    T: DeserializeOwned,
{
    let decoded = args
        .with(|bytes| serializer.deserialize::<T>(bytes))
        .map_err(|e| MethodError::internal(e.to_string()))?;
    drop(args);
    decoded.map_err(|e| MethodError::invalid_argument(format!("failed to decode arguments: {e}")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use streamhub_proto::StatusCode;

    use super::*;
    use crate::payload::PayloadPool;

    #[derive(Clone, Default)]
    struct Ctx {
        calls: Arc<AtomicUsize>,
    }

    fn payload<T: Serialize>(pool: &Arc<PayloadPool>, value: &T) -> PooledPayload {
        PooledPayload::rent(pool, &CborSerializer.to_vec(value).unwrap())
    }

    fn table() -> MethodTable<Ctx> {
        MethodTable::builder()
            .add("Add", |ctx: Ctx, (a, b): (i32, i32)| async move {
                ctx.calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, MethodError>(a + b)
            })
            .add("Fail", |_ctx: Ctx, (): ()| async move {
                Err::<(), _>(MethodError::new(StatusCode::FAILED_PRECONDITION, "not ready"))
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn typed_method_round_trip() {
        let pool = Arc::new(PayloadPool::default());
        let table = table();
        let ctx = Ctx::default();

        let id = table.resolve_name("Add").unwrap();
        assert_eq!(id, MethodId::from_name("Add"));
        let result = table.resolve(id).unwrap().invoke(ctx.clone(), payload(&pool, &(2, 3))).await.unwrap();

        let sum: i32 = CborSerializer.deserialize(&result).unwrap();
        assert_eq!(sum, 5);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[tokio::test]
    async fn bad_arguments_are_rejected_before_the_handler_runs() {
        let pool = Arc::new(PayloadPool::default());
        let table = table();
        let ctx = Ctx::default();

        let entry = table.resolve(MethodId::from_name("Add")).unwrap();
        let err = entry.invoke(ctx.clone(), payload(&pool, &"nope")).await.unwrap_err();
        assert_eq!(err.status, StatusCode::INVALID_ARGUMENT);
        assert_eq!(ctx.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let pool = Arc::new(PayloadPool::default());
        let err = table()
            .resolve(MethodId::from_name("Fail"))
            .unwrap()
            .invoke(Ctx::default(), payload(&pool, &()))
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::FAILED_PRECONDITION);
        assert_eq!(err.detail, "not ready");
    }

    #[test]
    fn unknown_ids_do_not_resolve() {
        let table = table();
        assert!(table.resolve(MethodId::new(0)).is_none());
        assert!(table.resolve_name("Missing").is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn colliding_ids_are_rejected() {
        let result = MethodTable::<Ctx>::builder()
            .add_raw_with_id(MethodId::new(1), "A", |_: Ctx, _: PooledPayload| async { Ok(Bytes::new()) })
            .add_raw_with_id(MethodId::new(1), "B", |_: Ctx, _: PooledPayload| async { Ok(Bytes::new()) })
            .build();
        assert_eq!(
            result.err(),
            Some(TableError::DuplicateMethod {
                method_id: MethodId::new(1),
                existing: "A".into(),
                name: "B".into(),
            })
        );
    }
}
