//! Request dispatch: one logical RPC call in, one typed result out.
//!
//! A [`Method`] declares the wire name, the number of params it takes and two
//! optional hooks: `before` rewrites the params into wire form, `after` maps
//! the raw JSON result into `T`. The dispatcher validates arity, picks the
//! request id and hands the request to the provider.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{DispatchError, ProviderError};
use crate::provider::Provider;
use crate::request::JsonRpcRequest;

pub type BeforeHook = Arc<dyn Fn(Vec<Value>) -> Result<Vec<Value>, String> + Send + Sync>;
pub type AfterHook<T> = Arc<dyn Fn(Value) -> Result<T, String> + Send + Sync>;

/// A callable RPC method description.
pub struct Method<T> {
    name: Cow<'static, str>,
    arity: usize,
    before: Option<BeforeHook>,
    after: AfterHook<T>,
}

impl<T> Clone for Method<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            arity: self.arity,
            before: self.before.clone(),
            after: Arc::clone(&self.after),
        }
    }
}

impl<T> std::fmt::Debug for Method<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("before", &self.before.is_some())
            .finish()
    }
}

impl<T: DeserializeOwned + 'static> Method<T> {
    /// A method whose result deserializes straight into `T`.
    pub fn new(name: impl Into<Cow<'static, str>>, arity: usize) -> Self {
        Self {
            name: name.into(),
            arity,
            before: None,
            after: Arc::new(|v| serde_json::from_value(v).map_err(|e| e.to_string())),
        }
    }
}

impl<T> Method<T> {
    /// Install the params hook.
    pub fn with_before<F>(mut self, hook: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Vec<Value>, String> + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(hook));
        self
    }

    /// Replace the result hook, changing the output type.
    pub fn with_after<U, F>(self, hook: F) -> Method<U>
    where
        F: Fn(Value) -> Result<U, String> + Send + Sync + 'static,
    {
        Method {
            name: self.name,
            arity: self.arity,
            before: self.before,
            after: Arc::new(hook),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> usize {
        self.arity
    }
}

/// Turns [`Method`] calls into provider requests.
///
/// Request ids are unique per dispatcher; socket providers re-map them on the
/// wire, so several dispatchers may share one connection.
pub struct RequestDispatcher {
    provider: Arc<dyn Provider>,
    next_id: AtomicU64,
}

impl RequestDispatcher {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    /// Validate, send and map one call.
    pub async fn execute<T>(&self, method: &Method<T>, params: Vec<Value>) -> Result<T, DispatchError> {
        if params.len() != method.arity {
            return Err(DispatchError::Arity {
                method: method.name().to_string(),
                expected: method.arity,
                got: params.len(),
            });
        }

        let params = match &method.before {
            Some(hook) => hook(params).map_err(|reason| DispatchError::InvalidParams {
                method: method.name().to_string(),
                reason,
            })?,
            None => params,
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(id, method = method.name(), "dispatching request");

        let resp = self
            .provider
            .send(JsonRpcRequest::new(id, method.name(), params))
            .await?;
        let raw = resp.into_result().map_err(ProviderError::Rpc)?;

        (method.after)(raw).map_err(|reason| DispatchError::Format {
            method: method.name().to_string(),
            reason,
        })
    }

    /// Callback-style adapter over [`execute`](Self::execute).
    ///
    /// `callback` receives `(error, result)` exactly once, before the returned
    /// future resolves with the same outcome.
    pub async fn execute_with_callback<T, F>(
        &self,
        method: &Method<T>,
        params: Vec<Value>,
        callback: F,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce(Option<&DispatchError>, Option<&T>),
    {
        let result = self.execute(method, params).await;
        match &result {
            Ok(value) => callback(None, Some(value)),
            Err(e) => callback(Some(e), None),
        }
        result
    }
}

impl std::fmt::Debug for RequestDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDispatcher")
            .field("provider", &self.provider.url())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalProvider;
    use crate::methods;
    use crate::request::JsonRpcError;
    use std::cell::Cell;

    fn dispatcher() -> (Arc<LocalProvider>, RequestDispatcher) {
        let node = Arc::new(LocalProvider::request_only());
        (node.clone(), RequestDispatcher::new(node))
    }

    #[tokio::test]
    async fn arity_mismatch_is_rejected_before_sending() {
        let (node, d) = dispatcher();
        let err = d
            .execute(&methods::transaction_receipt(), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Arity { expected: 1, got: 0, .. }));
        assert_eq!(node.calls("eth_getTransactionReceipt"), 0);
    }

    #[tokio::test]
    async fn hooks_shape_params_and_result() {
        let (node, d) = dispatcher();
        let head = node.mine();

        let block = d
            .execute(&methods::block_by_number(), vec![Value::from(head.number)])
            .await
            .unwrap();
        assert_eq!(block, Some(head.clone()));

        let number = d.execute(&methods::block_number(), vec![]).await.unwrap();
        assert_eq!(number, head.number);
    }

    #[tokio::test]
    async fn before_hook_rejection_surfaces_as_invalid_params() {
        let (_node, d) = dispatcher();
        let err = d
            .execute(&methods::block_by_number(), vec![Value::from("latest-ish")])
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::InvalidParams { .. }));
    }

    #[tokio::test]
    async fn node_errors_are_wrapped_as_provider_errors() {
        let (node, d) = dispatcher();
        node.fail_next(
            "eth_blockNumber",
            ProviderError::Rpc(JsonRpcError {
                code: -32000,
                message: "boom".into(),
                data: None,
            }),
        );
        let err = d.execute(&methods::block_number(), vec![]).await.unwrap_err();
        match err {
            DispatchError::Provider(ProviderError::Rpc(e)) => assert_eq!(e.message, "boom"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_method_is_a_node_error() {
        let (_node, d) = dispatcher();
        let method: Method<Value> = Method::new("eth_chainId", 0);
        let err = d.execute(&method, vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Provider(ProviderError::Rpc(JsonRpcError { code: -32601, .. }))
        ));
    }

    #[tokio::test]
    async fn callback_runs_exactly_once_with_the_same_outcome() {
        let (node, d) = dispatcher();
        node.mine();
        let calls = Cell::new(0);
        let seen = Cell::new(None);

        let result = d
            .execute_with_callback(&methods::block_number(), vec![], |err, value| {
                calls.set(calls.get() + 1);
                assert!(err.is_none());
                seen.set(value.copied());
            })
            .await
            .unwrap();

        assert_eq!(calls.get(), 1);
        assert_eq!(seen.get(), Some(result));

        let failed = Cell::new(false);
        let err = d
            .execute_with_callback(&methods::block_number(), vec![Value::Null], |err, value| {
                calls.set(calls.get() + 1);
                failed.set(err.is_some() && value.is_none());
            })
            .await;
        assert!(err.is_err());
        assert!(failed.get());
        assert_eq!(calls.get(), 2);
    }

    #[tokio::test]
    async fn format_errors_name_the_method() {
        let (node, d) = dispatcher();
        node.mine();
        let method = methods::block_number().with_after(|_| Err::<u64, _>("nope".to_string()));
        let err = d.execute(&method, vec![]).await.unwrap_err();
        assert!(err.to_string().contains("eth_blockNumber"));
    }
}
