//! Encrypted RPC routing.
//!
//! Methods are registered under `<scope>:<method>`, where the scope is the
//! session id. Params arrive as ciphertext and results leave as
//! ciphertext, both under the session's codec.

use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, PoisonError, RwLock},
};

use futures::{FutureExt, future::BoxFuture};
use happy_bridge_core::{CodecError, EnvelopeCodec};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::{RpcReply, RpcRequest};

/// RPC error. Its message is what the caller sees.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Unreadable params for {0}")]
    UnreadableParams(String),
    #[error("Invalid params: {0}")]
    InvalidParams(String),
    #[error("{0}")]
    Failed(String),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl From<serde_json::Error> for RpcError {
    fn from(e: serde_json::Error) -> Self {
        Self::InvalidParams(e.to_string())
    }
}

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RpcError>> + Send + Sync>;

/// `<scope>:<method>`.
#[must_use]
pub fn scoped_method(scope: &str, method: &str) -> String {
    format!("{scope}:{method}")
}

/// Dispatches decrypted RPC calls to registered handlers.
pub struct RpcRouter {
    scope: String,
    codec: EnvelopeCodec,
    handlers: RwLock<HashMap<String, Handler>>,
}

impl RpcRouter {
    pub fn new(scope: impl Into<String>, codec: EnvelopeCodec) -> Self {
        Self {
            scope: scope.into(),
            codec,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Register `handler` for `method` in this router's scope. Replaces an
    /// earlier handler of the same name.
    pub fn register<F, Fut>(&self, method: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RpcError>> + Send + 'static,
    {
        let name = scoped_method(&self.scope, method);
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, handler);
    }

    /// Scoped names of all registered methods, sorted.
    #[must_use]
    pub fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Call a scoped method with plaintext params.
    ///
    /// # Errors
    /// Returns error if the method is unknown or the handler fails.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
            .ok_or_else(|| RpcError::MethodNotFound(method.to_string()))?;
        handler(params).await
    }

    /// Handle one encrypted request and build its ack.
    pub async fn handle(&self, request: &RpcRequest) -> RpcReply {
        match self.try_handle(request).await {
            Ok(result) => RpcReply::Ok { result },
            Err(e) => {
                tracing::warn!(method = %request.method, error = %e, "RPC call failed");
                RpcReply::Err { error: e.to_string() }
            }
        }
    }

    async fn try_handle(&self, request: &RpcRequest) -> Result<String, RpcError> {
        let params = self
            .codec
            .decrypt::<Value>(&request.params)
            .ok_or_else(|| RpcError::UnreadableParams(request.method.clone()))?;
        tracing::debug!(method = %request.method, "RPC call");
        let result = self.call(&request.method, params).await?;
        Ok(self.codec.encrypt(&result)?)
    }
}

#[cfg(test)]
mod tests {
    use happy_bridge_core::{EncryptionVariant, SessionKey};
    use serde_json::json;

    use super::*;

    fn router() -> (RpcRouter, EnvelopeCodec) {
        let codec = EnvelopeCodec::new(SessionKey::generate(), EncryptionVariant::DataKey);
        let router = RpcRouter::new("s1", codec.clone());
        router.register("echo", |params| async move { Ok(json!({ "echo": params })) });
        router.register("fail", |_| async { Err(RpcError::Failed("nope".into())) });
        (router, codec)
    }

    #[tokio::test]
    async fn test_encrypted_round_trip() {
        let (router, codec) = router();
        let request = RpcRequest {
            id: Some("r1".into()),
            method: "s1:echo".into(),
            params: codec.encrypt(&json!({"x": 1})).unwrap(),
        };
        let RpcReply::Ok { result } = router.handle(&request).await else {
            panic!("expected success");
        };
        assert_eq!(codec.decrypt::<Value>(&result), Some(json!({"echo": {"x": 1}})));
    }

    #[tokio::test]
    async fn test_methods_are_scoped() {
        let (router, codec) = router();
        assert_eq!(router.methods(), vec!["s1:echo", "s1:fail"]);
        let request = RpcRequest {
            id: None,
            method: "s2:echo".into(),
            params: codec.encrypt(&json!({})).unwrap(),
        };
        assert_eq!(
            router.handle(&request).await,
            RpcReply::Err {
                error: "Method not found: s2:echo".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unreadable_params_and_handler_errors() {
        let (router, codec) = router();
        let foreign = EnvelopeCodec::new(SessionKey::generate(), EncryptionVariant::DataKey);
        let request = RpcRequest {
            id: None,
            method: "s1:echo".into(),
            params: foreign.encrypt(&json!({})).unwrap(),
        };
        assert!(matches!(router.handle(&request).await, RpcReply::Err { .. }));

        let request = RpcRequest {
            id: None,
            method: "s1:fail".into(),
            params: codec.encrypt(&json!({})).unwrap(),
        };
        assert_eq!(router.handle(&request).await, RpcReply::Err { error: "nope".into() });
    }
}
