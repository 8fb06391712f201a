//! Transaction context propagation
//!
//! A transaction context is an evaluation context bound to one logical unit
//! of work (typically a request). It is stored per task, so overlapping
//! asynchronous executions each observe their own value.
//!
//! ```
//! use flagwire_core::{EvaluationContext, TaskLocalTransactionContextPropagator,
//!     TransactionContextPropagator};
//!
//! # async fn example() {
//! let propagator = TaskLocalTransactionContextPropagator;
//! let ctx = EvaluationContext::new().with_targeting_key("user-1");
//!
//! propagator
//!     .set_transaction_context(ctx, Box::pin(async {
//!         let current = TaskLocalTransactionContextPropagator.get_transaction_context();
//!         assert_eq!(current.targeting_key(), Some("user-1"));
//!     }))
//!     .await;
//! # }
//! ```

use crate::context::EvaluationContext;
use futures::future::BoxFuture;

tokio::task_local! {
    static TRANSACTION_CONTEXT: EvaluationContext;
}

/// Stores and retrieves the ambient transaction context.
pub trait TransactionContextPropagator: Send + Sync {
    /// The context of the enclosing scope, or an empty context.
    fn get_transaction_context(&self) -> EvaluationContext;

    /// Run `scope` so that lookups made while it executes observe `context`.
    fn set_transaction_context<'a>(
        &'a self,
        context: EvaluationContext,
        scope: BoxFuture<'a, ()>,
    ) -> BoxFuture<'a, ()>;
}

/// Propagator that stores nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTransactionContextPropagator;

impl TransactionContextPropagator for NoopTransactionContextPropagator {
    fn get_transaction_context(&self) -> EvaluationContext {
        EvaluationContext::default()
    }

    fn set_transaction_context<'a>(
        &'a self,
        _context: EvaluationContext,
        scope: BoxFuture<'a, ()>,
    ) -> BoxFuture<'a, ()> {
        scope
    }
}

/// Propagator backed by a tokio task-local slot.
///
/// Nested scopes shadow outer ones and restore them on exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct TaskLocalTransactionContextPropagator;

impl TransactionContextPropagator for TaskLocalTransactionContextPropagator {
    fn get_transaction_context(&self) -> EvaluationContext {
        TRANSACTION_CONTEXT
            .try_with(|ctx| ctx.clone())
            .unwrap_or_default()
    }

    fn set_transaction_context<'a>(
        &'a self,
        context: EvaluationContext,
        scope: BoxFuture<'a, ()>,
    ) -> BoxFuture<'a, ()> {
        Box::pin(TRANSACTION_CONTEXT.scope(context, scope))
    }
}
