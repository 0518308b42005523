//! Model-agnostic CRUD over the auth directory tables.
//!
//! Callers speak in camelCase field names and JSON values; each model has a
//! fixed field table that maps names to columns and types. Where clauses are
//! compiled by a closed operator switch into parameterized SQL.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, params_from_iter};
use serde::Deserialize;
use serde_json::{Map, Number, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::StorageError;

pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Model {
    User,
    Session,
    Account,
    Verification,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Text,
    Integer,
    Boolean,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub column: &'static str,
    pub ty: FieldType,
    pub required: bool,
}

const fn field(name: &'static str, column: &'static str, ty: FieldType, required: bool) -> FieldSpec {
    FieldSpec { name, column, ty, required }
}

use FieldType::{Boolean, Integer, Text};

const USER_FIELDS: &[FieldSpec] = &[
    field("name", "name", Text, true),
    field("email", "email", Text, true),
    field("emailVerified", "email_verified", Boolean, true),
    field("image", "image", Text, false),
    field("createdAt", "created_at", Integer, true),
    field("updatedAt", "updated_at", Integer, true),
];

const SESSION_FIELDS: &[FieldSpec] = &[
    field("userId", "user_id", Text, true),
    field("token", "token", Text, true),
    field("expiresAt", "expires_at", Integer, true),
    field("ipAddress", "ip_address", Text, false),
    field("userAgent", "user_agent", Text, false),
    field("createdAt", "created_at", Integer, true),
    field("updatedAt", "updated_at", Integer, true),
];

const ACCOUNT_FIELDS: &[FieldSpec] = &[
    field("userId", "user_id", Text, true),
    field("accountId", "account_id", Text, true),
    field("providerId", "provider_id", Text, true),
    field("accessToken", "access_token", Text, false),
    field("refreshToken", "refresh_token", Text, false),
    field("accessTokenExpiresAt", "access_token_expires_at", Integer, false),
    field("scope", "scope", Text, false),
    field("createdAt", "created_at", Integer, true),
    field("updatedAt", "updated_at", Integer, true),
];

const VERIFICATION_FIELDS: &[FieldSpec] = &[
    field("identifier", "identifier", Text, true),
    field("value", "value", Text, true),
    field("expiresAt", "expires_at", Integer, true),
    field("createdAt", "created_at", Integer, true),
    field("updatedAt", "updated_at", Integer, true),
];

const ID_FIELD: FieldSpec = field("id", "id", Text, true);

impl Model {
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        match s {
            "user" => Ok(Self::User),
            "session" => Ok(Self::Session),
            "account" => Ok(Self::Account),
            "verification" => Ok(Self::Verification),
            _ => Err(StorageError::InvalidArgument(format!("unknown model: {s}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Session => "session",
            Self::Account => "account",
            Self::Verification => "verification",
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            Self::User => "auth_user",
            Self::Session => "auth_session",
            Self::Account => "auth_account",
            Self::Verification => "auth_verification",
        }
    }

    /// Data fields, not including `id`.
    pub fn fields(&self) -> &'static [FieldSpec] {
        match self {
            Self::User => USER_FIELDS,
            Self::Session => SESSION_FIELDS,
            Self::Account => ACCOUNT_FIELDS,
            Self::Verification => VERIFICATION_FIELDS,
        }
    }

    fn field(&self, name: &str) -> Result<&'static FieldSpec, StorageError> {
        if name == ID_FIELD.name {
            return Ok(&ID_FIELD);
        }
        self.fields().iter().find(|f| f.name == name).ok_or_else(|| {
            StorageError::InvalidArgument(format!("unknown field {name} on model {}", self.as_str()))
        })
    }

    fn select_columns(&self) -> String {
        std::iter::once(ID_FIELD.column)
            .chain(self.fields().iter().map(|f| f.column))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Contains,
    StartsWith,
    EndsWith,
}

impl Operator {
    pub fn parse(s: &str) -> Result<Self, StorageError> {
        Ok(match s {
            "eq" => Self::Eq,
            "ne" => Self::Ne,
            "lt" => Self::Lt,
            "lte" => Self::Lte,
            "gt" => Self::Gt,
            "gte" => Self::Gte,
            "in" => Self::In,
            "not_in" => Self::NotIn,
            "contains" => Self::Contains,
            "starts_with" => Self::StartsWith,
            "ends_with" => Self::EndsWith,
            _ => return Err(StorageError::InvalidArgument(format!("unsupported operator: {s}"))),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Connector {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WhereClause {
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    pub value: Value,
    #[serde(default)]
    pub connector: Connector,
}

impl WhereClause {
    pub fn new(field: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
            connector: Connector::And,
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub fn or(mut self) -> Self {
        self.connector = Connector::Or;
        self
    }
}

/// Borrowing handle over a connection or open transaction.
pub struct Directory<'c> {
    conn: &'c Connection,
}

impl<'c> Directory<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    /// Insert a row and return it as stored. `id` is generated unless given.
    pub fn create(&self, model: &str, data: &Row) -> Result<Row, StorageError> {
        let model = Model::parse(model)?;
        for key in data.keys() {
            model.field(key)?;
        }
        let id = match data.get(ID_FIELD.name) {
            None | Some(Value::Null) => Uuid::now_v7().to_string(),
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(other) => {
                return Err(StorageError::InvalidArgument(format!("invalid id: {other}")));
            }
        };

        let mut columns = vec![ID_FIELD.column];
        let mut values = vec![SqlValue::Text(id.clone())];
        for spec in model.fields() {
            match data.get(spec.name) {
                None | Some(Value::Null) if spec.required => {
                    return Err(StorageError::InvalidArgument(format!(
                        "missing required field {} on model {}",
                        spec.name,
                        model.as_str()
                    )));
                }
                None => {}
                Some(value) => {
                    columns.push(spec.column);
                    values.push(to_sql(spec, value)?);
                }
            }
        }
        let placeholders = (1..=values.len()).map(|i| format!("?{i}")).collect::<Vec<_>>().join(", ");
        self.conn.execute(
            &format!(
                "INSERT INTO {} ({}) VALUES ({placeholders})",
                model.table(),
                columns.join(", ")
            ),
            params_from_iter(values),
        )?;
        debug!(model = model.as_str(), %id, "directory row created");
        self.find(model.as_str(), &[WhereClause::eq(ID_FIELD.name, id.clone())])?
            .ok_or_else(|| StorageError::NotFound(format!("{} {id}", model.as_str())))
    }

    pub fn find(&self, model: &str, clauses: &[WhereClause]) -> Result<Option<Row>, StorageError> {
        Ok(self.find_many(model, clauses, Some(1), None)?.into_iter().next())
    }

    pub fn find_many(
        &self,
        model: &str,
        clauses: &[WhereClause],
        limit: Option<usize>,
        offset: Option<usize>,
    ) -> Result<Vec<Row>, StorageError> {
        let model = Model::parse(model)?;
        let (predicate, values) = compile_where(model, clauses)?;
        let mut sql = format!(
            "SELECT {} FROM {} WHERE {predicate} ORDER BY rowid",
            model.select_columns(),
            model.table()
        );
        match (limit, offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {offset}")),
            (None, None) => {}
        }
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(values), |row| read_row(model, row))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Update every matching row and return the first of them as updated.
    pub fn update(
        &self,
        model: &str,
        clauses: &[WhereClause],
        fields: &Row,
    ) -> Result<Option<Row>, StorageError> {
        let parsed = Model::parse(model)?;
        let ids = self.matching_ids(parsed, clauses)?;
        let Some(first) = ids.first().cloned() else {
            return Ok(None);
        };
        let (assignments, mut values) = compile_set(parsed, fields)?;
        let offset = values.len();
        let placeholders = (1..=ids.len())
            .map(|i| format!("?{}", offset + i))
            .collect::<Vec<_>>()
            .join(", ");
        values.extend(ids.into_iter().map(SqlValue::Text));
        self.conn.execute(
            &format!(
                "UPDATE {} SET {assignments} WHERE id IN ({placeholders})",
                parsed.table()
            ),
            params_from_iter(values),
        )?;
        self.find(model, &[WhereClause::eq(ID_FIELD.name, first)])
    }

    pub fn update_many(
        &self,
        model: &str,
        clauses: &[WhereClause],
        fields: &Row,
    ) -> Result<usize, StorageError> {
        let model = Model::parse(model)?;
        let (assignments, mut values) = compile_set(model, fields)?;
        let (predicate, where_values) = compile_where_from(model, clauses, values.len())?;
        values.extend(where_values);
        let n = self.conn.execute(
            &format!("UPDATE {} SET {assignments} WHERE {predicate}", model.table()),
            params_from_iter(values),
        )?;
        Ok(n)
    }

    /// Delete the first matching row. Dependent sessions and accounts of a
    /// deleted user go with it.
    pub fn delete(&self, model: &str, clauses: &[WhereClause]) -> Result<bool, StorageError> {
        let parsed = Model::parse(model)?;
        let Some(id) = self.matching_ids(parsed, clauses)?.into_iter().next() else {
            return Ok(false);
        };
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE id = ?1", parsed.table()),
            [id],
        )?;
        Ok(n > 0)
    }

    pub fn delete_many(&self, model: &str, clauses: &[WhereClause]) -> Result<usize, StorageError> {
        let model = Model::parse(model)?;
        let (predicate, values) = compile_where(model, clauses)?;
        let n = self.conn.execute(
            &format!("DELETE FROM {} WHERE {predicate}", model.table()),
            params_from_iter(values),
        )?;
        Ok(n)
    }

    pub fn count(&self, model: &str) -> Result<u64, StorageError> {
        match Model::parse(model)? {
            Model::User => {
                let n: i64 = self
                    .conn
                    .query_row("SELECT COUNT(*) FROM auth_user", [], |row| row.get(0))?;
                Ok(n as u64)
            }
            other => Err(StorageError::Unimplemented(format!("count for model {}", other.as_str()))),
        }
    }

    fn matching_ids(&self, model: Model, clauses: &[WhereClause]) -> Result<Vec<String>, StorageError> {
        let (predicate, values) = compile_where(model, clauses)?;
        let mut stmt = self.conn.prepare(&format!(
            "SELECT id FROM {} WHERE {predicate} ORDER BY rowid",
            model.table()
        ))?;
        let ids = stmt
            .query_map(params_from_iter(values), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }
}

fn read_row(model: Model, row: &rusqlite::Row) -> rusqlite::Result<Row> {
    let mut out = Map::new();
    out.insert(ID_FIELD.name.into(), Value::String(row.get(0)?));
    for (i, spec) in model.fields().iter().enumerate() {
        let idx = i + 1;
        let value = match spec.ty {
            Text => row.get::<_, Option<String>>(idx)?.map(Value::String),
            Integer => row.get::<_, Option<i64>>(idx)?.map(|n| Value::Number(Number::from(n))),
            Boolean => row.get::<_, Option<i64>>(idx)?.map(|n| Value::Bool(n != 0)),
        };
        out.insert(spec.name.into(), value.unwrap_or(Value::Null));
    }
    Ok(out)
}

fn to_sql(spec: &FieldSpec, value: &Value) -> Result<SqlValue, StorageError> {
    let mismatch = || {
        StorageError::InvalidArgument(format!("field {} cannot hold {value}", spec.name))
    };
    match (spec.ty, value) {
        (_, Value::Null) => Ok(SqlValue::Null),
        (Text, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (Integer, Value::Number(n)) => n.as_i64().map(SqlValue::Integer).ok_or_else(mismatch),
        (Boolean, Value::Bool(b)) => Ok(SqlValue::Integer(i64::from(*b))),
        (Boolean, Value::Number(n)) => match n.as_i64() {
            Some(0) => Ok(SqlValue::Integer(0)),
            Some(1) => Ok(SqlValue::Integer(1)),
            _ => Err(mismatch()),
        },
        _ => Err(mismatch()),
    }
}

fn compile_set(model: Model, fields: &Row) -> Result<(String, Vec<SqlValue>), StorageError> {
    if fields.is_empty() {
        return Err(StorageError::InvalidArgument("update without fields".into()));
    }
    let mut assignments = Vec::with_capacity(fields.len());
    let mut values = Vec::with_capacity(fields.len());
    for (name, value) in fields {
        let spec = model.field(name)?;
        if spec.name == ID_FIELD.name {
            return Err(StorageError::InvalidArgument("id cannot be updated".into()));
        }
        if spec.required && value.is_null() {
            return Err(StorageError::InvalidArgument(format!(
                "required field {name} cannot be null"
            )));
        }
        values.push(to_sql(spec, value)?);
        assignments.push(format!("{} = ?{}", spec.column, values.len()));
    }
    Ok((assignments.join(", "), values))
}

fn compile_where(model: Model, clauses: &[WhereClause]) -> Result<(String, Vec<SqlValue>), StorageError> {
    compile_where_from(model, clauses, 0)
}

/// Fold clauses left to right, so `a AND b OR c` reads `((a AND b) OR c)`.
/// Placeholders are numbered after `offset` existing parameters.
fn compile_where_from(
    model: Model,
    clauses: &[WhereClause],
    offset: usize,
) -> Result<(String, Vec<SqlValue>), StorageError> {
    let mut values = Vec::new();
    let mut predicate: Option<String> = None;
    for clause in clauses {
        let spec = model.field(&clause.field)?;
        let term = compile_clause(spec, clause, offset, &mut values)?;
        predicate = Some(match predicate {
            None => term,
            Some(prev) => {
                let joiner = match clause.connector {
                    Connector::And => "AND",
                    Connector::Or => "OR",
                };
                format!("({prev} {joiner} {term})")
            }
        });
    }
    Ok((predicate.unwrap_or_else(|| "1 = 1".into()), values))
}

fn compile_clause(
    spec: &FieldSpec,
    clause: &WhereClause,
    offset: usize,
    values: &mut Vec<SqlValue>,
) -> Result<String, StorageError> {
    let col = spec.column;
    let bind = |value: SqlValue, values: &mut Vec<SqlValue>| -> String {
        values.push(value);
        format!("?{}", offset + values.len())
    };
    let comparison = |op: &str, values: &mut Vec<SqlValue>| -> Result<String, StorageError> {
        let slot = bind(to_sql(spec, &clause.value)?, values);
        Ok(format!("{col} {op} {slot}"))
    };
    match clause.operator {
        Operator::Eq if clause.value.is_null() => Ok(format!("{col} IS NULL")),
        Operator::Ne if clause.value.is_null() => Ok(format!("{col} IS NOT NULL")),
        Operator::Eq => comparison("=", values),
        Operator::Ne => comparison("<>", values),
        Operator::Lt => comparison("<", values),
        Operator::Lte => comparison("<=", values),
        Operator::Gt => comparison(">", values),
        Operator::Gte => comparison(">=", values),
        Operator::In | Operator::NotIn => {
            let Value::Array(items) = &clause.value else {
                return Err(StorageError::InvalidArgument(format!(
                    "{} expects an array for field {}",
                    if clause.operator == Operator::In { "in" } else { "not_in" },
                    spec.name
                )));
            };
            if items.is_empty() {
                return Ok(if clause.operator == Operator::In { "0 = 1" } else { "1 = 1" }.into());
            }
            let mut slots = Vec::with_capacity(items.len());
            for item in items {
                slots.push(bind(to_sql(spec, item)?, values));
            }
            let op = if clause.operator == Operator::In { "IN" } else { "NOT IN" };
            Ok(format!("{col} {op} ({})", slots.join(", ")))
        }
        Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
            let Value::String(needle) = &clause.value else {
                return Err(StorageError::InvalidArgument(format!(
                    "pattern operators expect a string for field {}",
                    spec.name
                )));
            };
            let escaped = escape_like(needle);
            let pattern = match clause.operator {
                Operator::Contains => format!("%{escaped}%"),
                Operator::StartsWith => format!("{escaped}%"),
                _ => format!("%{escaped}"),
            };
            let slot = bind(SqlValue::Text(pattern), values);
            Ok(format!("{col} LIKE {slot} ESCAPE '\\'"))
        }
    }
}

fn escape_like(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStorage;
    use serde_json::json;

    fn row(v: Value) -> Row {
        match v {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    fn user(dir: &Directory, name: &str, email: &str, created: i64) -> Row {
        dir.create(
            "user",
            &row(json!({
                "name": name,
                "email": email,
                "emailVerified": false,
                "createdAt": created,
                "updatedAt": created,
            })),
        )
        .unwrap()
    }

    #[test]
    fn create_requires_mandatory_fields() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        let err = dir
            .create("user", &row(json!({"name": "A", "createdAt": 0, "updatedAt": 0})))
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
        let err = dir.create("organization", &Row::new()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidArgument(_)));
    }

    #[test]
    fn comparison_and_pattern_operators() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        user(&dir, "Ann", "ann@x.io", 10);
        user(&dir, "Bob", "bob@y.io", 20);
        user(&dir, "Cy_", "cy@x.io", 30);

        let gte = dir
            .find_many("user", &[WhereClause::new("createdAt", Operator::Gte, 20)], None, None)
            .unwrap();
        assert_eq!(gte.len(), 2);

        let xs = dir
            .find_many("user", &[WhereClause::new("email", Operator::EndsWith, "@x.io")], None, None)
            .unwrap();
        assert_eq!(xs.len(), 2);

        // underscore is literal, not a wildcard
        let literal = dir
            .find_many("user", &[WhereClause::new("name", Operator::Contains, "_")], None, None)
            .unwrap();
        assert_eq!(literal.len(), 1);
        assert_eq!(literal[0]["name"], json!("Cy_"));

        let in_list = dir
            .find_many(
                "user",
                &[WhereClause::new("name", Operator::In, json!(["Ann", "Bob"]))],
                None,
                None,
            )
            .unwrap();
        assert_eq!(in_list.len(), 2);

        let paged = dir.find_many("user", &[], Some(1), Some(1)).unwrap();
        assert_eq!(paged[0]["name"], json!("Bob"));
    }

    #[test]
    fn or_connector_folds_left() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        user(&dir, "Ann", "ann@x.io", 10);
        user(&dir, "Bob", "bob@y.io", 20);
        let both = dir
            .find_many(
                "user",
                &[WhereClause::eq("name", "Ann"), WhereClause::eq("name", "Bob").or()],
                None,
                None,
            )
            .unwrap();
        assert_eq!(both.len(), 2);
    }

    #[test]
    fn null_equality_uses_is_null() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        user(&dir, "Ann", "ann@x.io", 10);
        let no_image = dir.find("user", &[WhereClause::eq("image", Value::Null)]).unwrap();
        assert!(no_image.is_some());
        let with_image = dir
            .find("user", &[WhereClause::new("image", Operator::Ne, Value::Null)])
            .unwrap();
        assert!(with_image.is_none());
    }

    #[test]
    fn unknown_field_and_bad_operator_value_are_rejected() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        assert!(matches!(
            dir.find("user", &[WhereClause::eq("password", "x")]),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            dir.find("user", &[WhereClause::new("name", Operator::In, "Ann")]),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(Operator::parse("between").is_err());
    }

    #[test]
    fn count_is_user_only() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let dir = Directory::new(storage.conn());
        user(&dir, "Ann", "ann@x.io", 10);
        assert_eq!(dir.count("user").unwrap(), 1);
        assert!(matches!(dir.count("session"), Err(StorageError::Unimplemented(_))));
    }

    #[test]
    fn where_clause_deserializes_with_defaults() {
        let clause: WhereClause =
            serde_json::from_value(json!({"field": "email", "value": "a@x"})).unwrap();
        assert_eq!(clause.operator, Operator::Eq);
        assert_eq!(clause.connector, Connector::And);
        let clause: WhereClause = serde_json::from_value(
            json!({"field": "name", "operator": "not_in", "value": [], "connector": "OR"}),
        )
        .unwrap();
        assert_eq!(clause.operator, Operator::NotIn);
        assert_eq!(clause.connector, Connector::Or);
    }
}
