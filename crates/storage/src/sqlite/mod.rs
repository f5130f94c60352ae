use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu,
    SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError, StorageResult,
};
use super::ids::{ConversationId, MessageId};
use super::types::{
    ConversationRecord, DEFAULT_CONVERSATION_TITLE, MessageRecord, MessageRole, NewConversation,
    NewMessage,
};
use super::{ConversationRepo, MessageRepo};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // Later calls open their own connections.
        pool.close().await;

        Ok(Self { database_url })
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Each call gets its own thread and current-thread runtime so sync callers
        // inside a tokio runtime never block_on it.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ConversationRepo for SqliteStorage {
    fn create_conversation(&self, input: NewConversation) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;

            let title = if input.title.trim().is_empty() {
                DEFAULT_CONVERSATION_TITLE.to_string()
            } else {
                input.title
            };
            let conversation_id = ConversationId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO conversations (id, title, created_at, updated_at) VALUES (?, ?, ?, ?)",
            )
            .bind(conversation_id.to_string())
            .bind(title.clone())
            .bind(now)
            .bind(now)
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                title,
                created_at_unix_millis: i64_to_u64(now, "conversation-create-created-at")?,
                updated_at_unix_millis: i64_to_u64(now, "conversation-create-updated-at")?,
            })
        })
    }

    fn list_conversations(&self) -> StorageResult<Vec<ConversationRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-connect").await?;
            let rows = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, title, created_at, updated_at FROM conversations ORDER BY updated_at DESC, id DESC",
            )
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            rows.into_iter().map(conversation_row_to_record).collect()
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            let row = load_conversation_row(&mut connection, conversation_id, "conversation-get-query")
                .await?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn touch_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-touch", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-touch-connect").await?;
            let now = unix_timestamp_millis();

            // updated_at strictly increases on every touch.
            let update_result = sqlx::query(
                "UPDATE conversations SET updated_at = MAX(?, updated_at + 1) WHERE id = ?",
            )
            .bind(now)
            .bind(conversation_id.to_string())
            .execute(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-touch-apply",
            })?;

            if update_result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-touch-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let row = load_conversation_row(
                &mut connection,
                conversation_id,
                "conversation-touch-load",
            )
            .await?
            .context(NotFoundSnafu {
                stage: "conversation-touch-load-missing",
                entity: "conversation",
                id: conversation_id.to_string(),
            })?;

            conversation_row_to_record(row)
        })
    }

    fn delete_conversation(&self, conversation_id: ConversationId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-delete-connect").await?;
            let result = sqlx::query("DELETE FROM conversations WHERE id = ?")
                .bind(conversation_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-delete-missing",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

impl MessageRepo for SqliteStorage {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-append-connect").await?;
            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            let exists = sqlx::query_scalar::<_, i64>(
                "SELECT 1 FROM conversations WHERE id = ? LIMIT 1",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-conversation-exists",
            })?;
            if exists.is_none() {
                return NotFoundSnafu {
                    stage: "message-append-missing-conversation",
                    entity: "conversation",
                    id: conversation_id.to_string(),
                }
                .fail();
            }

            let tail = sqlx::query_as::<_, MessageTailRow>(
                "SELECT COALESCE(MAX(seq), 0) AS last_seq, COALESCE(MAX(created_at), 0) AS last_created_at FROM messages WHERE conversation_id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-load-tail",
            })?;

            let next_seq = tail.last_seq + 1;
            // created_at is monotonic within a conversation.
            let created_at = unix_timestamp_millis().max(tail.last_created_at);
            let message_id = MessageId::new_v7();

            sqlx::query(
                "INSERT INTO messages (id, conversation_id, seq, role, content, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.to_string())
            .bind(next_seq)
            .bind(role_to_sql(input.role))
            .bind(input.content.clone())
            .bind(created_at)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(MessageRecord {
                id: message_id,
                conversation_id,
                seq: i64_to_u64(next_seq, "message-append-seq")?,
                role: input.role,
                content: input.content,
                created_at_unix_millis: i64_to_u64(created_at, "message-append-created-at")?,
            })
        })
    }

    fn list_messages(&self, conversation_id: ConversationId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, seq, role, content, created_at FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, seq ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn delete_message(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
    ) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-delete-connect").await?;
            let result = sqlx::query("DELETE FROM messages WHERE conversation_id = ? AND id = ?")
                .bind(conversation_id.to_string())
                .bind(message_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "message-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "message-delete-missing",
                    entity: "message",
                    id: message_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    title: String,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    seq: i64,
    role: String,
    content: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageTailRow {
    last_seq: i64,
    last_created_at: i64,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        title: row.title,
        created_at_unix_millis: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        role: role_from_sql(&row.role)?,
        content: row.content,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn load_conversation_row(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    stage: &'static str,
) -> StorageResult<Option<ConversationRow>> {
    sqlx::query_as::<_, ConversationRow>(
        "SELECT id, title, created_at, updated_at FROM conversations WHERE id = ?",
    )
    .bind(conversation_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

fn role_to_sql(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn role_from_sql(raw: &str) -> StorageResult<MessageRole> {
    match raw {
        "user" => Ok(MessageRole::User),
        "assistant" => Ok(MessageRole::Assistant),
        _ => InvariantViolationSnafu {
            stage: "message-role-from-sql",
            details: format!("unknown message role '{raw}'"),
        }
        .fail(),
    }
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
