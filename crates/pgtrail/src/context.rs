//! Async-scoped audit context
//!
//! The current [`AuditContext`] lives in a tokio task-local, so it follows
//! the logical call chain across await points without any process-global
//! state. [`scope`] binds a context for the extent of a future, [`merge`]
//! mutates the innermost binding in place, [`current`] reads it.
//!
//! Task-locals do not cross `tokio::spawn`; a spawned subtask that needs the
//! binding must be re-wrapped with [`scope`].

use std::cell::RefCell;
use std::future::Future;

use crate::record::AuditContext;

tokio::task_local! {
    static CURRENT_CONTEXT: RefCell<AuditContext>;
}

/// Run `fut` with `ctx` as the ambient audit context.
///
/// The binding covers the synchronous and asynchronous extent of `fut`;
/// nested scopes shadow outer ones and are restored on exit.
pub async fn scope<F, T>(ctx: AuditContext, fut: F) -> T
where
    F: Future<Output = T>,
{
    CURRENT_CONTEXT.scope(RefCell::new(ctx), fut).await
}

/// Merge `partial` into the innermost binding (right-biased).
///
/// Returns `false` when no scope is active; callers that need a fallback
/// layer (such as logger-level defaults) handle that case themselves.
pub fn merge(partial: &AuditContext) -> bool {
    CURRENT_CONTEXT
        .try_with(|current| current.borrow_mut().merge(partial))
        .is_ok()
}

/// Snapshot of the innermost binding, if any scope is active.
pub fn current() -> Option<AuditContext> {
    CURRENT_CONTEXT.try_with(|current| current.borrow().clone()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scope_binds_context() {
        assert!(current().is_none());

        let seen = scope(AuditContext::new().with_user_id("alice"), async {
            current().and_then(|c| c.user_id)
        })
        .await;

        assert_eq!(seen.as_deref(), Some("alice"));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn test_scope_survives_suspension() {
        let seen = scope(AuditContext::new().with_user_id("alice"), async {
            tokio::task::yield_now().await;
            current().and_then(|c| c.user_id)
        })
        .await;

        assert_eq!(seen.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_nested_scopes_shadow() {
        scope(AuditContext::new().with_user_id("outer"), async {
            let inner = scope(AuditContext::new().with_user_id("inner"), async {
                current().and_then(|c| c.user_id)
            })
            .await;

            assert_eq!(inner.as_deref(), Some("inner"));
            assert_eq!(
                current().and_then(|c| c.user_id).as_deref(),
                Some("outer")
            );
        })
        .await;
    }

    #[tokio::test]
    async fn test_merge_updates_binding_in_place() {
        scope(AuditContext::new().with_user_id("alice"), async {
            let merged = merge(&AuditContext::new().with_ip_address("10.1.1.1"));
            assert!(merged);

            let ctx = current().unwrap();
            assert_eq!(ctx.user_id.as_deref(), Some("alice"));
            assert_eq!(ctx.ip_address.as_deref(), Some("10.1.1.1"));
        })
        .await;
    }

    #[tokio::test]
    async fn test_merge_outside_scope_reports_inactive() {
        assert!(!merge(&AuditContext::new().with_user_id("nobody")));
    }
}
