// ── Trigger DDL ──
//
// One generic plpgsql function serializes the changed row into the
// notification envelope; each watched table gets an AFTER trigger that
// calls it. Both statements are re-runnable.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::error::Error;

/// Notification channel shared by every watched table.
pub const DEFAULT_CHANNEL: &str = "table_changes";

/// Name of the generic trigger function.
pub const TRIGGER_FUNCTION: &str = "notify_table_change";

const MAX_IDENTIFIER_LEN: usize = 63;

/// Accept only plain, unquoted SQL identifiers (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn validate_identifier(name: &str) -> Result<&str, Error> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid_start && valid_rest && name.len() <= MAX_IDENTIFIER_LEN {
        Ok(name)
    } else {
        Err(Error::InvalidIdentifier(name.to_owned()))
    }
}

/// `CREATE OR REPLACE` for the generic trigger function.
pub fn trigger_function_sql(channel: &str) -> Result<String, Error> {
    let channel = validate_identifier(channel)?;
    Ok(format!(
        r"CREATE OR REPLACE FUNCTION {TRIGGER_FUNCTION}() RETURNS trigger AS $$
DECLARE
    payload json;
BEGIN
    payload := json_build_object(
        'operation', TG_OP,
        'table', TG_TABLE_NAME,
        'old_data', CASE WHEN TG_OP IN ('UPDATE', 'DELETE') THEN row_to_json(OLD) ELSE NULL END,
        'new_data', CASE WHEN TG_OP IN ('INSERT', 'UPDATE') THEN row_to_json(NEW) ELSE NULL END,
        'timestamp', NOW()
    );
    PERFORM pg_notify('{channel}', payload::text);
    RETURN COALESCE(NEW, OLD);
END;
$$ LANGUAGE plpgsql;"
    ))
}

/// Drop-if-exists then create the per-table row trigger.
pub fn table_trigger_sql(table: &str) -> Result<String, Error> {
    let table = validate_identifier(table)?;
    Ok(format!(
        "DROP TRIGGER IF EXISTS {table}_change_trigger ON {table};\n\
         CREATE TRIGGER {table}_change_trigger \
         AFTER INSERT OR UPDATE OR DELETE ON {table} \
         FOR EACH ROW EXECUTE FUNCTION {TRIGGER_FUNCTION}();"
    ))
}

// ── Installer ────────────────────────────────────────────────────────

/// Installs the capture DDL. Failures here are fatal to startup.
#[async_trait]
pub trait TriggerInstaller: Send + Sync {
    async fn install_function(&self, channel: &str) -> Result<(), Error>;
    async fn install_trigger(&self, table: &str) -> Result<(), Error>;
}

/// Runs the DDL against a Postgres pool.
#[derive(Debug, Clone)]
pub struct PgTriggerInstaller {
    pool: PgPool,
}

impl PgTriggerInstaller {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TriggerInstaller for PgTriggerInstaller {
    async fn install_function(&self, channel: &str) -> Result<(), Error> {
        let sql = trigger_function_sql(channel)?;
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        tracing::info!(function = TRIGGER_FUNCTION, channel, "installed trigger function");
        Ok(())
    }

    async fn install_trigger(&self, table: &str) -> Result<(), Error> {
        let sql = table_trigger_sql(table)?;
        sqlx::raw_sql(&sql).execute(&self.pool).await?;
        tracing::info!(table, "installed change trigger");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn identifiers() {
        assert!(validate_identifier("stations").is_ok());
        assert!(validate_identifier("_t2").is_ok());
        for bad in ["", "2t", "st ations", "t;drop", "a\"b", "ä"] {
            assert!(validate_identifier(bad).is_err(), "{bad:?}");
        }
        assert!(validate_identifier(&"x".repeat(64)).is_err());
    }

    #[test]
    fn table_trigger_is_idempotent_ddl() {
        let sql = table_trigger_sql("clusters").unwrap();
        assert!(sql.starts_with("DROP TRIGGER IF EXISTS clusters_change_trigger ON clusters;"));
        assert!(sql.contains(
            "CREATE TRIGGER clusters_change_trigger AFTER INSERT OR UPDATE OR DELETE ON clusters \
             FOR EACH ROW EXECUTE FUNCTION notify_table_change();"
        ));
    }

    #[test]
    fn function_notifies_on_channel() {
        let sql = trigger_function_sql(DEFAULT_CHANNEL).unwrap();
        assert!(sql.starts_with("CREATE OR REPLACE FUNCTION notify_table_change()"));
        assert!(sql.contains("pg_notify('table_changes', payload::text)"));
        assert!(sql.contains("'timestamp', NOW()"));
    }

    #[test]
    fn ddl_rejects_injection() {
        assert!(matches!(
            table_trigger_sql("x; DROP TABLE y"),
            Err(Error::InvalidIdentifier(_))
        ));
        assert!(trigger_function_sql("chan'nel").is_err());
    }
}
