//! Directory facade over the auth tables (user, session, account,
//! verification). Reads run on the connection, writes in a retried
//! transaction.

use tracing::debug;

use workbench_core::Context;
use workbench_storage::{Directory, Row, WhereClause};

use crate::{EngineError, Workbench};

impl Workbench {
    pub fn directory_create(&mut self, ctx: &Context, model: &str, data: &Row) -> Result<Row, EngineError> {
        let row = self.mutate(ctx, &[], |tx| Ok(Directory::new(tx).create(model, data)?))?;
        debug!(model, "directory row created");
        Ok(row)
    }

    pub fn directory_find(
        &self,
        ctx: &Context,
        model: &str,
        clauses: &[WhereClause],
    ) -> Result<Option<Row>, EngineError> {
        ctx.check()?;
        Ok(Directory::new(self.storage.conn()).find(model, clauses)?)
    }

    pub fn directory_find_many(
        &self,
        ctx: &Context,
        model: &str,
        clauses: &[WhereClause],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Row>, EngineError> {
        ctx.check()?;
        Ok(Directory::new(self.storage.conn()).find_many(model, clauses, limit, offset)?)
    }

    /// Returns the first matched row after the update, if any matched.
    pub fn directory_update(
        &mut self,
        ctx: &Context,
        model: &str,
        clauses: &[WhereClause],
        fields: &Row,
    ) -> Result<Option<Row>, EngineError> {
        self.mutate(ctx, &[], |tx| Ok(Directory::new(tx).update(model, clauses, fields)?))
    }

    pub fn directory_update_many(
        &mut self,
        ctx: &Context,
        model: &str,
        clauses: &[WhereClause],
        fields: &Row,
    ) -> Result<usize, EngineError> {
        self.mutate(ctx, &[], |tx| Ok(Directory::new(tx).update_many(model, clauses, fields)?))
    }

    pub fn directory_delete(&mut self, ctx: &Context, model: &str, clauses: &[WhereClause]) -> Result<bool, EngineError> {
        self.mutate(ctx, &[], |tx| Ok(Directory::new(tx).delete(model, clauses)?))
    }

    pub fn directory_delete_many(
        &mut self,
        ctx: &Context,
        model: &str,
        clauses: &[WhereClause],
    ) -> Result<usize, EngineError> {
        let n = self.mutate(ctx, &[], |tx| Ok(Directory::new(tx).delete_many(model, clauses)?))?;
        debug!(model, deleted = n, "directory rows deleted");
        Ok(n)
    }

    /// Only `user` supports counting; other models report `Unimplemented`.
    pub fn directory_count(&self, ctx: &Context, model: &str) -> Result<u64, EngineError> {
        ctx.check()?;
        Ok(Directory::new(self.storage.conn()).count(model)?)
    }
}
