//! Transaction wrapper shared by every mutating operation.
//!
//! Flow: ownership check, then a retried `IMMEDIATE` transaction, then
//! pointer-health validation of the lists the mutation touched, then an
//! optional WAL checkpoint. A cancellation that lands after commit skips the
//! post-commit steps but never undoes the write.

use rusqlite::{Connection, Transaction};
use tracing::{debug, error, warn};
use uuid::Uuid;

use workbench_core::Context;
use workbench_storage::{ListHealth, ListKind, linked_list};

use crate::{Access, EngineError, Resource, Workbench};

impl Workbench {
    pub(crate) fn authorize(&self, ctx: &Context, resource: Resource) -> Result<(), EngineError> {
        ctx.check()?;
        match self.owner.check(ctx, resource)? {
            Access::Allowed => Ok(()),
            Access::Hidden => Err(EngineError::NotFound(describe(resource))),
            Access::Denied => Err(EngineError::PermissionDenied(describe(resource))),
        }
    }

    /// Run `f` in one write transaction and validate `touched` lists after
    /// commit.
    pub(crate) fn mutate<T, F>(
        &mut self,
        ctx: &Context,
        touched: &[(ListKind, Uuid)],
        f: F,
    ) -> Result<T, EngineError>
    where
        F: FnMut(&Transaction<'_>) -> Result<T, EngineError>,
    {
        let value = self.storage.write(ctx, f)?;
        if ctx.check().is_err() {
            debug!("cancelled after commit, skipping post-commit checks");
            return Ok(value);
        }
        for (kind, parent) in touched {
            let health = linked_list::validate(self.storage.conn(), *kind, *parent)?;
            if !health.is_healthy() {
                error!(list = kind.as_str(), %parent, ?health, "post-commit validation failed");
                return Err(EngineError::Internal(format!(
                    "{} list under {parent} failed validation after commit",
                    kind.as_str()
                )));
            }
        }
        if self.storage.config().checkpoint_after_mutation
            && let Err(e) = self.storage.checkpoint()
        {
            warn!(error = %e, "checkpoint after mutation failed");
        }
        Ok(value)
    }

    /// Plan against the committed state, then apply inside a transaction that
    /// re-verifies the plan. `apply` reports a stale plan with
    /// [`EngineError::Conflict`], which triggers a fresh plan.
    pub(crate) fn run_planned<P, T, PF, AF>(
        &mut self,
        ctx: &Context,
        touched: &[(ListKind, Uuid)],
        plan: PF,
        apply: AF,
    ) -> Result<T, EngineError>
    where
        PF: Fn(&Connection) -> Result<P, EngineError>,
        AF: Fn(&Transaction<'_>, &P) -> Result<T, EngineError>,
    {
        let max_retries = self.storage.config().max_retries;
        let mut attempt = 0u32;
        loop {
            ctx.check()?;
            let planned = plan(self.storage.conn())?;
            match self.mutate(ctx, touched, |tx| apply(tx, &planned)) {
                Err(EngineError::Conflict(reason)) if attempt < max_retries => {
                    attempt += 1;
                    debug!(attempt, %reason, "plan went stale, replanning");
                }
                other => return other,
            }
        }
    }

    /// Pointer-level health report for one list.
    pub fn validate_list(
        &self,
        ctx: &Context,
        kind: ListKind,
        parent: Uuid,
    ) -> Result<ListHealth, EngineError> {
        ctx.check()?;
        Ok(linked_list::validate(self.storage.conn(), kind, parent)?)
    }
}

fn describe(resource: Resource) -> String {
    match resource {
        Resource::Endpoint(id) => format!("endpoint {id}"),
        Resource::Example(id) => format!("example {id}"),
    }
}
