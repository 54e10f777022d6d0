// ── Notification source ──
//
// The long-lived LISTEN connection. Abstracted so the receive loop can be
// exercised without a database.

use async_trait::async_trait;
use sqlx::PgPool;
use sqlx::postgres::PgListener;

use crate::error::Error;

/// A connection that delivers raw notification payloads.
#[async_trait]
pub trait NotificationSource: Send {
    /// Subscribe to `channel`.
    async fn listen(&mut self, channel: &str) -> Result<(), Error>;

    /// Wait for the next payload. A lost connection is reported as
    /// [`Error::ConnectionLost`] and is not retried here.
    async fn recv(&mut self) -> Result<String, Error>;

    /// Cheap round-trip to prove the connection is still alive.
    async fn ping(&mut self) -> Result<(), Error>;
}

/// `LISTEN` on a dedicated Postgres connection.
pub struct PgNotificationSource {
    listener: PgListener,
}

impl PgNotificationSource {
    /// Open a dedicated connection from `pool`'s connect options.
    pub async fn connect(pool: &PgPool) -> Result<Self, Error> {
        let listener = PgListener::connect_with(pool).await?;
        Ok(Self { listener })
    }
}

#[async_trait]
impl NotificationSource for PgNotificationSource {
    async fn listen(&mut self, channel: &str) -> Result<(), Error> {
        self.listener.listen(channel).await?;
        tracing::info!(channel, "listening for change notifications");
        Ok(())
    }

    async fn recv(&mut self) -> Result<String, Error> {
        match self.listener.try_recv().await {
            Ok(Some(notification)) => Ok(notification.payload().to_owned()),
            Ok(None) => Err(Error::ConnectionLost(
                "listening connection closed by server".into(),
            )),
            Err(e) => Err(Error::ConnectionLost(e.to_string())),
        }
    }

    async fn ping(&mut self) -> Result<(), Error> {
        sqlx::query("SELECT 1")
            .execute(&mut self.listener)
            .await
            .map_err(|e| Error::ConnectionLost(format!("liveness probe failed: {e}")))?;
        Ok(())
    }
}
