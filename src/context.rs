//! Flow-scoped "current database" carrier.
//!
//! A request flow runs inside [`scope`] (or [`run`] when the database is
//! already known). Within that flow, [`set_current`] rebinds the slot and
//! [`current`] reads it; the façade uses it when no explicit database is
//! given. Slots belong to one task: concurrent flows never see each other's
//! value, and a nested scope restores the outer value when it ends.
//!
//! Spawned tasks start without a slot. Use [`spawn_scoped`] to carry the
//! current value into a new task.

use crate::error::{DbError, DbResult};
use std::cell::RefCell;
use std::future::Future;

tokio::task_local! {
    static CURRENT_DATABASE: RefCell<Option<String>>;
}

/// Run `fut` with the current database bound to `database`.
pub async fn run<F>(database: impl Into<String>, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_DATABASE
        .scope(RefCell::new(Some(database.into())), fut)
        .await
}

/// Run `fut` in a fresh, unbound slot.
pub async fn scope<F>(fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_DATABASE.scope(RefCell::new(None), fut).await
}

/// Database bound in the innermost scope, if any.
pub fn current() -> Option<String> {
    CURRENT_DATABASE
        .try_with(|slot| slot.borrow().clone())
        .ok()
        .flatten()
}

/// Bind the innermost scope to `database`.
pub fn set_current(database: impl Into<String>) -> DbResult<()> {
    let database = database.into();
    CURRENT_DATABASE
        .try_with(|slot| {
            *slot.borrow_mut() = Some(database);
        })
        .map_err(|_| DbError::invalid_input("no database context scope is active"))
}

/// Unbind the innermost scope. No-op outside a scope.
pub fn clear_current() {
    let _ = CURRENT_DATABASE.try_with(|slot| slot.borrow_mut().take());
}

/// Spawn `fut` on the runtime with the caller's current database carried
/// into a new scope.
pub fn spawn_scoped<F>(fut: F) -> tokio::task::JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    let database = current();
    tokio::spawn(CURRENT_DATABASE.scope(RefCell::new(database), fut))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_outside_scope() {
        assert_eq!(current(), None);
        assert!(set_current("tenant_a").is_err());
        clear_current();
    }

    #[tokio::test]
    async fn test_run_binds_and_restores() {
        run("outer", async {
            assert_eq!(current().as_deref(), Some("outer"));
            run("inner", async {
                assert_eq!(current().as_deref(), Some("inner"));
            })
            .await;
            assert_eq!(current().as_deref(), Some("outer"));
        })
        .await;
        assert_eq!(current(), None);
    }

    #[tokio::test]
    async fn test_set_current_within_scope() {
        scope(async {
            assert_eq!(current(), None);
            set_current("tenant_b").unwrap();
            assert_eq!(current().as_deref(), Some("tenant_b"));
            clear_current();
            assert_eq!(current(), None);
        })
        .await;
    }

    #[tokio::test]
    async fn test_concurrent_flows_are_isolated() {
        let a = scope(async {
            set_current("tenant_a").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            current()
        });
        let b = scope(async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            set_current("tenant_b").unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            current()
        });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.as_deref(), Some("tenant_a"));
        assert_eq!(b.as_deref(), Some("tenant_b"));
    }

    #[tokio::test]
    async fn test_spawn_scoped_carries_value() {
        let handle = run("tenant_c", async { spawn_scoped(async { current() }) }).await;
        assert_eq!(handle.await.unwrap().as_deref(), Some("tenant_c"));

        let plain = run("tenant_c", async { tokio::spawn(async { current() }) }).await;
        assert_eq!(plain.await.unwrap(), None);
    }
}
