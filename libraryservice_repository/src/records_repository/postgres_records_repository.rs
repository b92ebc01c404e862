use anyhow::Context;
use chrono::NaiveDate;
use deadpool_postgres::{ManagerConfig, Object, Pool, PoolConfig, RecyclingMethod, Runtime};
use serde::Deserialize;
use tokio_postgres::error::SqlState;
use tokio_postgres::{NoTls, Row, Statement};

use crate::api::{
    BookStatus, CatalogRecord, CatalogRecordDetails, NewReservation, NewUser, Reservation,
    ReservationId, ReservationWithRecord, User, UserId, STORED_STATUS_AVAILABLE,
};
use crate::credentials;
use crate::records_repository::{
    dedup_by_id, escape_like_pattern, RecordStore, RecordStoreError, RecordTransaction,
};

const STORED_DATE_FORMAT: &str = "%Y-%m-%d";

const BOOK_COLUMNS: &str =
    r#"b.id, b.title, b."imgUrl", b.author, b.publisher, b."callNum", b.location, b.status"#;

pub const DEFAULT_MAX_CONNECTIONS: usize = 16;

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostgresRecordStoreConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Size of the connection pool, callers beyond it wait for a free connection
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl PostgresRecordStoreConfig {
    fn connection_str(&self) -> String {
        format!(
            "postgresql://{}:{}@{}",
            self.username, self.password, self.hostname
        )
    }
}

fn create_pool(config: &PostgresRecordStoreConfig) -> anyhow::Result<Pool> {
    let mut pool_config = deadpool_postgres::Config::new();
    pool_config.url = Some(config.connection_str());
    pool_config.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });
    pool_config.pool = Some(PoolConfig::new(config.max_connections.max(1)));
    pool_config
        .create_pool(Some(Runtime::Tokio1), NoTls)
        .context("Failed to create postgres pool")
}

/// Record store backed by a bounded pool of PostgreSQL connections.
///
/// A serializable transaction keeps its pooled connection until commit or rollback.
pub struct PostgresRecordStore {
    pool: Pool,
}

impl PostgresRecordStore {
    pub async fn init(config: PostgresRecordStoreConfig) -> anyhow::Result<Self> {
        tracing::info!(
            "Connecting to postgres at {} as {}",
            config.hostname,
            config.username
        );
        let pool = create_pool(&config)?;
        let client = pool.get().await.context("Failed to start postgres")?;

        client
            .batch_execute(
                r#"
        CREATE TABLE IF NOT EXISTS books (
            id              TEXT PRIMARY KEY,
            title           TEXT,
            "imgUrl"        TEXT,
            author          TEXT,
            publisher       TEXT,
            "callNum"       TEXT,
            location        TEXT,
            status          TEXT
            )
        "#,
            )
            .await
            .context("Failed to setup books table")?;

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS users (
            id              SERIAL PRIMARY KEY,
            username        TEXT UNIQUE,
            password        TEXT,
            nickname        TEXT
            )
        ",
            )
            .await
            .context("Failed to setup users table")?;

        client
            .batch_execute(
                "
        CREATE TABLE IF NOT EXISTS reservations (
            id              SERIAL PRIMARY KEY,
            user_id         INTEGER REFERENCES users(id),
            book_id         TEXT REFERENCES books(id),
            date            TEXT,
            due_date        TEXT,
            extension_count INTEGER DEFAULT 0 CHECK (extension_count BETWEEN 0 AND 1)
            );
        ALTER TABLE reservations ADD COLUMN IF NOT EXISTS due_date TEXT;
        ALTER TABLE reservations ADD COLUMN IF NOT EXISTS extension_count INTEGER DEFAULT 0;
        ",
            )
            .await
            .context("Failed to setup reservations table")?;

        Ok(Self { pool })
    }

    /// Closes the pool, pending and future checkouts fail
    pub fn close(&self) {
        self.pool.close();
    }

    async fn client(&self) -> Result<Object, RecordStoreError> {
        Ok(self.pool.get().await?)
    }

    async fn query_records(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
    ) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        let client = self.client().await?;
        let stmt: Statement = client.prepare_cached(sql).await?;
        let rows = client.query(&stmt, params).await?;
        rows.iter().map(|row| record_from_row(row, 0)).collect()
    }
}

fn record_from_row(row: &Row, first_column: usize) -> Result<CatalogRecord, RecordStoreError> {
    let text = |idx: usize| -> Result<String, RecordStoreError> {
        Ok(row
            .try_get::<_, Option<String>>(first_column + idx)?
            .unwrap_or_default())
    };
    Ok(CatalogRecord {
        id: row.try_get(first_column)?,
        title: text(1)?,
        img_url: row.try_get(first_column + 2)?,
        author: text(3)?,
        publisher: text(4)?,
        call_number: text(5)?,
        location: text(6)?,
        status: BookStatus::from_stored_str(&text(7)?),
    })
}

fn parse_stored_date(value: &str) -> Result<NaiveDate, RecordStoreError> {
    NaiveDate::parse_from_str(value, STORED_DATE_FORMAT).map_err(|e| {
        RecordStoreError::InvalidStoredValue(format!("date '{}': {}", value, e))
    })
}

fn format_stored_date(date: NaiveDate) -> String {
    date.format(STORED_DATE_FORMAT).to_string()
}

fn reservation_from_row(row: &Row) -> Result<Reservation, RecordStoreError> {
    let start_date: String = row.try_get(3)?;
    let due_date: String = row.try_get(4)?;
    let extension_count: Option<i32> = row.try_get(5)?;
    Ok(Reservation {
        id: row.try_get(0)?,
        user_id: row.try_get(1)?,
        book_id: row.try_get(2)?,
        start_date: parse_stored_date(&start_date)?,
        due_date: parse_stored_date(&due_date)?,
        extension_count: extension_count.unwrap_or_default(),
    })
}

#[async_trait::async_trait]
impl RecordStore for PostgresRecordStore {
    #[tracing::instrument(skip_all, fields(records = records.len()))]
    async fn upsert_records(
        &self,
        records: &[CatalogRecordDetails],
    ) -> Result<usize, RecordStoreError> {
        let records = dedup_by_id(records);
        if records.is_empty() {
            return Ok(0);
        }
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        let titles: Vec<&str> = records.iter().map(|r| r.title.as_str()).collect();
        let img_urls: Vec<Option<&str>> = records.iter().map(|r| r.img_url.as_deref()).collect();
        let authors: Vec<&str> = records.iter().map(|r| r.author.as_str()).collect();
        let publishers: Vec<&str> = records.iter().map(|r| r.publisher.as_str()).collect();
        let call_numbers: Vec<&str> = records.iter().map(|r| r.call_number.as_str()).collect();
        let locations: Vec<&str> = records.iter().map(|r| r.location.as_str()).collect();

        // Single statement, so the whole page lands atomically. Status is left out of the update
        let client = self.client().await?;
        let stmt: Statement = client
            .prepare_cached(
                r#"
        INSERT INTO books (id, title, "imgUrl", author, publisher, "callNum", location, status)
        SELECT id, title, img_url, author, publisher, call_num, location, $8::TEXT
        FROM UNNEST($1::TEXT[], $2::TEXT[], $3::TEXT[], $4::TEXT[], $5::TEXT[], $6::TEXT[], $7::TEXT[])
            AS incoming(id, title, img_url, author, publisher, call_num, location)
        ON CONFLICT (id) DO UPDATE SET
            title = EXCLUDED.title,
            "imgUrl" = EXCLUDED."imgUrl",
            author = EXCLUDED.author,
            publisher = EXCLUDED.publisher,
            "callNum" = EXCLUDED."callNum",
            location = EXCLUDED.location
        "#,
            )
            .await?;

        let written = client
            .execute(
                &stmt,
                &[
                    &ids,
                    &titles,
                    &img_urls,
                    &authors,
                    &publishers,
                    &call_numbers,
                    &locations,
                    &STORED_STATUS_AVAILABLE,
                ],
            )
            .await?;
        Ok(written as usize)
    }

    async fn find_by_id(&self, book_id: &str) -> Result<CatalogRecord, RecordStoreError> {
        self.query_records(
            &format!("SELECT {} FROM books b WHERE b.id = $1", BOOK_COLUMNS),
            &[&book_id],
        )
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| RecordStoreError::BookNotFound(book_id.to_string()))
    }

    async fn search_by_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        let pattern = escape_like_pattern(query);
        self.query_records(
            &format!(
                "SELECT {} FROM books b WHERE b.title ILIKE $1 OR b.author ILIKE $1 LIMIT $2",
                BOOK_COLUMNS
            ),
            &[&pattern, &(limit as i64)],
        )
        .await
    }

    async fn list_records(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        self.query_records(
            &format!("SELECT {} FROM books b LIMIT $1", BOOK_COLUMNS),
            &[&(limit as i64)],
        )
        .await
    }

    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        let pattern = format!("%{}%", STORED_STATUS_AVAILABLE);
        self.query_records(
            &format!(
                "SELECT {} FROM books b WHERE b.status LIKE $1 OR lower(b.status) = 'available' LIMIT $2",
                BOOK_COLUMNS
            ),
            &[&pattern, &(limit as i64)],
        )
        .await
    }

    #[tracing::instrument(skip_all, fields(username = %new_user.username))]
    async fn create_user(&self, new_user: NewUser) -> Result<UserId, RecordStoreError> {
        let client = self.client().await?;
        let stmt: Statement = client
            .prepare_cached(
                "INSERT INTO users (username, password, nickname) VALUES ($1, $2, $3) RETURNING id",
            )
            .await?;

        let secret_digest = credentials::hash_secret(&new_user.secret);
        let rows = client
            .query(
                &stmt,
                &[&new_user.username, &secret_digest, &new_user.display_name],
            )
            .await;

        match rows {
            Ok(rows) => Ok(rows
                .first()
                .ok_or_else(|| RecordStoreError::Other("Id not returned".to_string()))?
                .try_get(0)?),
            Err(err) if err.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
                Err(RecordStoreError::UsernameTaken(new_user.username))
            }
            Err(other_err) => Err(other_err.into()),
        }
    }

    async fn find_user(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>, RecordStoreError> {
        let client = self.client().await?;
        let stmt: Statement = client
            .prepare_cached("SELECT id, password, nickname FROM users WHERE username = $1")
            .await?;

        let rows = client.query(&stmt, &[&username]).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let secret_digest: Option<String> = row.try_get(1)?;
        if !credentials::verify_secret(secret, secret_digest.as_deref().unwrap_or_default()) {
            return Ok(None);
        }
        Ok(Some(User {
            id: row.try_get(0)?,
            username: username.to_string(),
            display_name: row
                .try_get::<_, Option<String>>(2)?
                .unwrap_or_default(),
        }))
    }

    async fn list_reservations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ReservationWithRecord>, RecordStoreError> {
        let client = self.client().await?;
        let stmt: Statement = client
            .prepare_cached(&format!(
                "SELECT r.id, r.date, r.due_date, r.extension_count, {}
                 FROM reservations r JOIN books b ON r.book_id = b.id
                 WHERE r.user_id = $1 ORDER BY r.id",
                BOOK_COLUMNS
            ))
            .await?;

        let rows = client.query(&stmt, &[&user_id]).await?;
        rows.iter()
            .map(|row| {
                let start_date: String = row.try_get(1)?;
                let due_date: String = row.try_get(2)?;
                let extension_count: Option<i32> = row.try_get(3)?;
                Ok(ReservationWithRecord {
                    reservation_id: row.try_get(0)?,
                    start_date: parse_stored_date(&start_date)?,
                    due_date: parse_stored_date(&due_date)?,
                    extension_count: extension_count.unwrap_or_default(),
                    record: record_from_row(row, 4)?,
                })
            })
            .collect()
    }

    async fn begin_serializable(&self) -> Result<Box<dyn RecordTransaction>, RecordStoreError> {
        let client = self.client().await?;
        client
            .batch_execute("BEGIN ISOLATION LEVEL SERIALIZABLE")
            .await?;
        Ok(Box::new(PostgresTransaction {
            client: Some(client),
        }))
    }
}

/// Transaction holding a pooled connection until commit or rollback
struct PostgresTransaction {
    client: Option<Object>,
}

impl PostgresTransaction {
    fn client(&self) -> Result<&Object, RecordStoreError> {
        self.client
            .as_ref()
            .ok_or_else(|| RecordStoreError::Other("Transaction already finished".to_string()))
    }

    async fn finish(mut self, command: &str) -> Result<(), RecordStoreError> {
        match self.client.take() {
            Some(client) => Ok(client.batch_execute(command).await?),
            None => Ok(()),
        }
    }
}

impl Drop for PostgresTransaction {
    fn drop(&mut self) {
        // Detached from the pool, closing it makes the server roll the open transaction back
        if let Some(client) = self.client.take() {
            drop(Object::take(client));
        }
    }
}

#[async_trait::async_trait]
impl RecordTransaction for PostgresTransaction {
    async fn book_status(&mut self, book_id: &str) -> Result<Option<BookStatus>, RecordStoreError> {
        let rows = self
            .client()?
            .query("SELECT status FROM books WHERE id = $1", &[&book_id])
            .await?;
        rows.first()
            .map(|row| -> Result<BookStatus, RecordStoreError> {
                let status: Option<String> = row.try_get(0)?;
                Ok(BookStatus::from_stored_str(status.as_deref().unwrap_or_default()))
            })
            .transpose()
    }

    async fn set_book_status(
        &mut self,
        book_id: &str,
        status: BookStatus,
    ) -> Result<(), RecordStoreError> {
        let updated = self
            .client()?
            .execute(
                "UPDATE books SET status = $1 WHERE id = $2",
                &[&status.as_stored_str(), &book_id],
            )
            .await?;
        if updated == 0 {
            Err(RecordStoreError::BookNotFound(book_id.to_string()))
        } else {
            Ok(())
        }
    }

    async fn user_exists(&mut self, user_id: UserId) -> Result<bool, RecordStoreError> {
        let rows = self
            .client()?
            .query("SELECT 1 FROM users WHERE id = $1", &[&user_id])
            .await?;
        Ok(!rows.is_empty())
    }

    async fn count_reservations(&mut self, user_id: UserId) -> Result<usize, RecordStoreError> {
        let row = self
            .client()?
            .query_one(
                "SELECT COUNT(*) FROM reservations WHERE user_id = $1",
                &[&user_id],
            )
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count as usize)
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, RecordStoreError> {
        let rows = self
            .client()?
            .query(
                "INSERT INTO reservations (user_id, book_id, date, due_date, extension_count)
                 VALUES ($1, $2, $3, $4, 0) RETURNING id",
                &[
                    &reservation.user_id,
                    &reservation.book_id,
                    &format_stored_date(reservation.start_date),
                    &format_stored_date(reservation.due_date),
                ],
            )
            .await?;
        let id: ReservationId = rows
            .first()
            .ok_or_else(|| RecordStoreError::Other("Id not returned".to_string()))?
            .try_get(0)?;
        Ok(Reservation {
            id,
            user_id: reservation.user_id,
            book_id: reservation.book_id,
            start_date: reservation.start_date,
            due_date: reservation.due_date,
            extension_count: 0,
        })
    }

    async fn find_reservation(
        &mut self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<Option<Reservation>, RecordStoreError> {
        let rows = self
            .client()?
            .query(
                "SELECT id, user_id, book_id, date, due_date, extension_count
                 FROM reservations WHERE id = $1 AND user_id = $2",
                &[&reservation_id, &user_id],
            )
            .await?;
        rows.first().map(reservation_from_row).transpose()
    }

    async fn update_reservation(
        &mut self,
        reservation: &Reservation,
    ) -> Result<(), RecordStoreError> {
        self.client()?
            .execute(
                "UPDATE reservations SET due_date = $1, extension_count = $2 WHERE id = $3",
                &[
                    &format_stored_date(reservation.due_date),
                    &reservation.extension_count,
                    &reservation.id,
                ],
            )
            .await?;
        Ok(())
    }

    async fn delete_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<(), RecordStoreError> {
        self.client()?
            .execute("DELETE FROM reservations WHERE id = $1", &[&reservation_id])
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RecordStoreError> {
        (*self).finish("COMMIT").await
    }

    async fn rollback(self: Box<Self>) -> Result<(), RecordStoreError> {
        (*self).finish("ROLLBACK").await
    }
}
