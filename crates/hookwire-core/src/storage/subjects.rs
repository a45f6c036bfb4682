//! Subject loading from application tables.
//!
//! Each subject type maps to a table whose rows are read whole as JSON and
//! exposed as `JsonSubject`s. The table must have an `id` column; the
//! subject id is compared against its text form.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use sqlx::PgPool;

use crate::{
    error::{CoreError, Result},
    models::{SubjectRef, SubjectType},
    subject::{JsonSubject, Subject, SubjectResolver},
};

/// Resolves subjects by reading their rows from PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgSubjectResolver {
    pool: Arc<PgPool>,
    tables: HashMap<SubjectType, String>,
}

impl PgSubjectResolver {
    /// Creates a resolver with no table mappings.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool, tables: HashMap::new() }
    }

    /// Maps a subject type to the table holding its rows.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::InvalidInput` if `table` is not a plain
    /// (optionally schema-qualified) SQL identifier.
    pub fn with_table(
        mut self,
        subject_type: impl Into<SubjectType>,
        table: impl Into<String>,
    ) -> Result<Self> {
        let table = table.into();
        validate_table_name(&table)?;
        self.tables.insert(subject_type.into(), table);
        Ok(self)
    }
}

/// Accepts `name` or `schema.name` where each part is `[A-Za-z_][A-Za-z0-9_]*`.
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let valid_part = |part: &str| {
        let mut chars = part.chars();
        chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    };

    let parts: Vec<&str> = table.split('.').collect();
    if parts.len() <= 2 && parts.iter().all(|part| valid_part(part)) {
        Ok(())
    } else {
        Err(CoreError::InvalidInput(format!("'{table}' is not a valid table name")))
    }
}

#[async_trait::async_trait]
impl SubjectResolver for PgSubjectResolver {
    async fn load(&self, reference: &SubjectRef) -> Result<Option<Arc<dyn Subject>>> {
        let table = self.tables.get(&reference.subject_type).ok_or_else(|| {
            CoreError::NotFound(format!(
                "no table mapped for subject type '{}'",
                reference.subject_type
            ))
        })?;

        let query = format!("SELECT to_jsonb(t) FROM {table} t WHERE t.id::text = $1");
        let row: Option<Value> = sqlx::query_scalar(&query)
            .bind(&reference.subject_id)
            .fetch_optional(&*self.pool)
            .await?;

        match row {
            Some(value) => {
                let subject = JsonSubject::from_value(reference.clone(), value)?;
                Ok(Some(Arc::new(subject)))
            },
            None => {
                tracing::debug!(subject = %reference, table = %table, "subject row not found");
                Ok(None)
            },
        }
    }
}
