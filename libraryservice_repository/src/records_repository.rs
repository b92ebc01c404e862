pub use in_memory_records_repository::InMemoryRecordStore;
pub use postgres_records_repository::{
    PostgresRecordStore, PostgresRecordStoreConfig, DEFAULT_MAX_CONNECTIONS,
};

use tokio_postgres::error::SqlState;

use crate::api::{
    BookId, BookStatus, CatalogRecord, CatalogRecordDetails, NewReservation, NewUser,
    Reservation, ReservationId, ReservationWithRecord, User, UserId,
};

mod in_memory_records_repository;
mod postgres_records_repository;

/// Default cap on rows returned by listing and search queries
pub const DEFAULT_LISTING_LIMIT: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    #[error("Book {0} not found")]
    BookNotFound(BookId),

    #[error("Username {0} already exists")]
    UsernameTaken(String),

    #[error("Constraint violated: {0}")]
    ConstraintViolation(String),

    #[error("Concurrent transaction conflict, transaction rolled back")]
    SerializationConflict,

    #[error("Invalid stored value: {0}")]
    InvalidStoredValue(String),

    #[error("DatabaseFailure failure {0}")]
    DatabaseFailure(tokio_postgres::Error),

    #[error("Connection pool failure {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Other error {0}")]
    Other(String),
}

impl From<tokio_postgres::Error> for RecordStoreError {
    fn from(err: tokio_postgres::Error) -> Self {
        let Some(code) = err.code() else {
            return RecordStoreError::DatabaseFailure(err);
        };
        if code == &SqlState::T_R_SERIALIZATION_FAILURE || code == &SqlState::T_R_DEADLOCK_DETECTED
        {
            RecordStoreError::SerializationConflict
        } else if code == &SqlState::UNIQUE_VIOLATION
            || code == &SqlState::FOREIGN_KEY_VIOLATION
            || code == &SqlState::CHECK_VIOLATION
        {
            let message = err
                .as_db_error()
                .map(|db_err| db_err.message().to_string())
                .unwrap_or_else(|| err.to_string());
            RecordStoreError::ConstraintViolation(message)
        } else {
            RecordStoreError::DatabaseFailure(err)
        }
    }
}

#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or replaces records keyed by id as one atomic write.
    /// Existing rows keep their status, new rows start as available.
    /// Returns number of distinct records written
    async fn upsert_records(
        &self,
        records: &[CatalogRecordDetails],
    ) -> Result<usize, RecordStoreError>;

    /// Retrieves a single catalog record
    async fn find_by_id(&self, book_id: &str) -> Result<CatalogRecord, RecordStoreError>;

    /// Case insensitive substring match on title or author, at most `limit` rows
    async fn search_by_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogRecord>, RecordStoreError>;

    /// Lists up to `limit` records regardless of status
    async fn list_records(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError>;

    /// Lists up to `limit` records that can currently be reserved
    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError>;

    /// Adds a user, fails with UsernameTaken when the username exists
    async fn create_user(&self, new_user: NewUser) -> Result<UserId, RecordStoreError>;

    /// Returns the user only when the username exists and the secret matches
    async fn find_user(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>, RecordStoreError>;

    /// All reservations of the user joined with their catalog records
    async fn list_reservations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ReservationWithRecord>, RecordStoreError>;

    /// Starts a transaction with serializable isolation
    async fn begin_serializable(&self) -> Result<Box<dyn RecordTransaction>, RecordStoreError>;
}

/// Unit of work over books, users and reservations.
/// Dropping it without `commit` discards all its writes.
#[async_trait::async_trait]
pub trait RecordTransaction: Send {
    /// None when the book does not exist
    async fn book_status(&mut self, book_id: &str) -> Result<Option<BookStatus>, RecordStoreError>;

    async fn set_book_status(
        &mut self,
        book_id: &str,
        status: BookStatus,
    ) -> Result<(), RecordStoreError>;

    async fn user_exists(&mut self, user_id: UserId) -> Result<bool, RecordStoreError>;

    async fn count_reservations(&mut self, user_id: UserId) -> Result<usize, RecordStoreError>;

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, RecordStoreError>;

    /// None when reservation does not exist or belongs to a different user
    async fn find_reservation(
        &mut self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<Option<Reservation>, RecordStoreError>;

    /// Stores due date and extension count of the reservation
    async fn update_reservation(&mut self, reservation: &Reservation)
        -> Result<(), RecordStoreError>;

    async fn delete_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<(), RecordStoreError>;

    async fn commit(self: Box<Self>) -> Result<(), RecordStoreError>;

    async fn rollback(self: Box<Self>) -> Result<(), RecordStoreError>;
}

/// Escapes LIKE wildcards so user input is matched literally
pub(crate) fn escape_like_pattern(query: &str) -> String {
    let mut escaped = String::with_capacity(query.len() + 2);
    escaped.push('%');
    for c in query.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped.push('%');
    escaped
}

/// Keeps the last occurrence of every id, preserving first-seen order
pub(crate) fn dedup_by_id(records: &[CatalogRecordDetails]) -> Vec<CatalogRecordDetails> {
    let mut result: Vec<CatalogRecordDetails> = Vec::with_capacity(records.len());
    for record in records {
        match result.iter_mut().find(|existing| existing.id == record.id) {
            Some(existing) => *existing = record.clone(),
            None => result.push(record.clone()),
        }
    }
    result
}
