//! Lending state machine over the record store.
//!
//! Every transition (reserve, extend, cancel) reads and writes inside one
//! serializable transaction. Transactions aborted by a concurrent writer are
//! re-run from scratch a bounded number of times, domain failures never are.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use serde::Deserialize;

use libraryservice_repository::api::{
    BookStatus, NewReservation, Reservation, ReservationId, ReservationWithRecord, UserId,
};
use libraryservice_repository::records_repository::{
    RecordStore, RecordStoreError, RecordTransaction,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct LendingPolicy {
    pub max_active_reservations: usize,
    pub loan_period_days: u64,
    pub extension_days: u64,
}

impl Default for LendingPolicy {
    fn default() -> Self {
        Self {
            max_active_reservations: 3,
            loan_period_days: 7,
            extension_days: 7,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    #[error("At most {0} books can be reserved at once")]
    LimitExceeded(usize),

    #[error("Book {0} is already on loan or cannot be reserved")]
    NotAvailable(String),

    #[error("Reservation {0} not found")]
    NotFound(ReservationId),

    #[error("Reservation {0} can only be extended once")]
    AlreadyExtended(ReservationId),

    #[error("User {0} not found")]
    UserNotFound(UserId),

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Storage failure: {0}")]
    Storage(RecordStoreError),
}

impl From<RecordStoreError> for ReservationError {
    fn from(err: RecordStoreError) -> Self {
        match err {
            RecordStoreError::ConstraintViolation(message) => ReservationError::Rejected(message),
            err => ReservationError::Storage(err),
        }
    }
}

impl ReservationError {
    fn is_conflict(&self) -> bool {
        matches!(
            self,
            ReservationError::Storage(RecordStoreError::SerializationConflict)
        )
    }
}

/// Source of the current calendar date
pub type Clock = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

pub fn local_clock() -> Clock {
    Arc::new(|| chrono::Local::now().date_naive())
}

#[derive(Debug)]
enum Transition<'a> {
    Reserve {
        user_id: UserId,
        book_id: &'a str,
    },
    Extend {
        reservation_id: ReservationId,
        user_id: UserId,
    },
    Cancel {
        reservation_id: ReservationId,
        user_id: UserId,
    },
}

pub struct ReservationManager {
    store: Arc<dyn RecordStore>,
    policy: LendingPolicy,
    clock: Clock,
    max_attempts: u32,
}

impl ReservationManager {
    pub fn new(store: Arc<dyn RecordStore>, policy: LendingPolicy) -> Self {
        Self::with_clock(store, policy, local_clock())
    }

    pub fn with_clock(store: Arc<dyn RecordStore>, policy: LendingPolicy, clock: Clock) -> Self {
        Self {
            store,
            policy,
            clock,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn policy(&self) -> &LendingPolicy {
        &self.policy
    }

    /// Loans an available book to the user starting today
    pub async fn reserve(
        &self,
        user_id: UserId,
        book_id: &str,
    ) -> Result<Reservation, ReservationError> {
        self.execute(Transition::Reserve { user_id, book_id }).await
    }

    /// Pushes the due date of the user's reservation once
    pub async fn extend(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<Reservation, ReservationError> {
        self.execute(Transition::Extend {
            reservation_id,
            user_id,
        })
        .await
    }

    /// Removes the user's reservation and makes the book available again.
    /// Returns the removed reservation
    pub async fn cancel(
        &self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<Reservation, ReservationError> {
        self.execute(Transition::Cancel {
            reservation_id,
            user_id,
        })
        .await
    }

    #[tracing::instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ReservationWithRecord>, ReservationError> {
        Ok(self.store.list_reservations_for_user(user_id).await?)
    }

    #[tracing::instrument(skip(self))]
    async fn execute(&self, transition: Transition<'_>) -> Result<Reservation, ReservationError> {
        let today = (self.clock)();
        let mut attempt = 1;
        loop {
            match self.run_once(&transition, today).await {
                Err(err) if err.is_conflict() && attempt < self.max_attempts => {
                    tracing::warn!(attempt, "Transaction conflict, retrying");
                    tokio::time::sleep(RETRY_BACKOFF_STEP * attempt).await;
                    attempt += 1;
                }
                Err(err) => {
                    tracing::info!(attempt, "Transition failed: {}", err);
                    return Err(err);
                }
                Ok(reservation) => return Ok(reservation),
            }
        }
    }

    async fn run_once(
        &self,
        transition: &Transition<'_>,
        today: NaiveDate,
    ) -> Result<Reservation, ReservationError> {
        let mut transaction = self.store.begin_serializable().await?;
        match self.apply(transaction.as_mut(), transition, today).await {
            Ok(reservation) => {
                transaction.commit().await?;
                Ok(reservation)
            }
            Err(err) => {
                if let Err(rollback_err) = transaction.rollback().await {
                    tracing::warn!("Rollback failed: {}", rollback_err);
                }
                Err(err)
            }
        }
    }

    async fn apply(
        &self,
        transaction: &mut dyn RecordTransaction,
        transition: &Transition<'_>,
        today: NaiveDate,
    ) -> Result<Reservation, ReservationError> {
        match *transition {
            Transition::Reserve { user_id, book_id } => {
                if !transaction.user_exists(user_id).await? {
                    return Err(ReservationError::UserNotFound(user_id));
                }
                let active = transaction.count_reservations(user_id).await?;
                if active >= self.policy.max_active_reservations {
                    return Err(ReservationError::LimitExceeded(
                        self.policy.max_active_reservations,
                    ));
                }
                if transaction.book_status(book_id).await? != Some(BookStatus::Available) {
                    return Err(ReservationError::NotAvailable(book_id.to_string()));
                }
                let reservation = transaction
                    .insert_reservation(NewReservation {
                        user_id,
                        book_id: book_id.to_string(),
                        start_date: today,
                        due_date: today + Days::new(self.policy.loan_period_days),
                    })
                    .await?;
                transaction
                    .set_book_status(book_id, BookStatus::Loaned)
                    .await?;
                Ok(reservation)
            }
            Transition::Extend {
                reservation_id,
                user_id,
            } => {
                let mut reservation = transaction
                    .find_reservation(reservation_id, user_id)
                    .await?
                    .ok_or(ReservationError::NotFound(reservation_id))?;
                if reservation.extension_count >= 1 {
                    return Err(ReservationError::AlreadyExtended(reservation_id));
                }
                reservation.due_date = reservation.due_date + Days::new(self.policy.extension_days);
                reservation.extension_count += 1;
                transaction.update_reservation(&reservation).await?;
                Ok(reservation)
            }
            Transition::Cancel {
                reservation_id,
                user_id,
            } => {
                let reservation = transaction
                    .find_reservation(reservation_id, user_id)
                    .await?
                    .ok_or(ReservationError::NotFound(reservation_id))?;
                transaction.delete_reservation(reservation_id).await?;
                transaction
                    .set_book_status(&reservation.book_id, BookStatus::Available)
                    .await?;
                Ok(reservation)
            }
        }
    }
}


#[cfg(test)]
mod tests_reservation_manager_postgres {
    use serial_test::file_serial;
    use testcontainers::core::IntoContainerPort;
    use testcontainers::runners::AsyncRunner;
    use testcontainers::{ContainerAsync, GenericImage, ImageExt};

    use libraryservice_repository::api::{CatalogRecordDetails, NewUser};
    use libraryservice_repository::records_repository::{
        PostgresRecordStore, PostgresRecordStoreConfig,
    };

    use super::*;

    async fn start_postgres_container_and_init_store(
    ) -> (ContainerAsync<GenericImage>, PostgresRecordStore) {
        let _pg_container = GenericImage::new("postgres", "latest")
            .with_mapped_port(5432, 5432.tcp())
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .start()
            .await
            .expect("Failed to start postgres");

        for _ in 0..10 {
            if let Ok(store) = PostgresRecordStore::init(PostgresRecordStoreConfig {
                hostname: "127.0.0.1".to_string(),
                username: "postgres".to_string(),
                password: "postgres".to_string(),
                max_connections: 4,
            })
            .await
            {
                return (_pg_container, store);
            }
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
        panic!("Failed to setup postgres container")
    }

    fn details(id: &str) -> CatalogRecordDetails {
        CatalogRecordDetails {
            id: id.to_string(),
            title: "title".to_string(),
            img_url: None,
            author: "author".to_string(),
            publisher: "publisher".to_string(),
            call_number: "813.5".to_string(),
            location: "library".to_string(),
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Concurrent reserves of one book on separate connections:
    /// exactly one wins, the others observe the loan after retrying
    async fn test_concurrent_reserves_on_postgres() {
        const READERS: usize = 5;
        let (_container, store) = start_postgres_container_and_init_store().await;
        store.upsert_records(&[details("A")]).await.unwrap();
        let mut user_ids = vec![];
        for n in 0..READERS {
            user_ids.push(
                store
                    .create_user(NewUser {
                        username: format!("reader{}", n),
                        secret: "secret".to_string(),
                        display_name: "nick".to_string(),
                    })
                    .await
                    .unwrap(),
            );
        }
        let store = Arc::new(store);
        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            LendingPolicy::default(),
        ));

        let handles: Vec<_> = user_ids
            .into_iter()
            .map(|user_id| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.reserve(user_id, "A").await })
            })
            .collect();
        let results: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|handle| handle.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|result| result.is_err())
            .all(|result| matches!(result, Err(ReservationError::NotAvailable(_)))));
        assert_eq!(
            store.find_by_id("A").await.unwrap().status,
            BookStatus::Loaned
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[file_serial(key, path => "../.pgtestslock")]
    /// Concurrent reserves of one user on different books: the count read and the
    /// inserts conflict, so retried transactions see the limit reached
    async fn test_concurrent_reserves_of_one_user_on_postgres() {
        let (_container, store) = start_postgres_container_and_init_store().await;
        let books: Vec<_> = ["B1", "B2", "C1", "C2", "C3", "C4"]
            .into_iter()
            .map(details)
            .collect();
        store.upsert_records(&books).await.unwrap();
        let user_id = store
            .create_user(NewUser {
                username: "reader".to_string(),
                secret: "secret".to_string(),
                display_name: "nick".to_string(),
            })
            .await
            .unwrap();
        let store = Arc::new(store);
        let manager = Arc::new(ReservationManager::new(
            store.clone(),
            LendingPolicy::default(),
        ));
        manager.reserve(user_id, "B1").await.unwrap();
        manager.reserve(user_id, "B2").await.unwrap();

        let handles: Vec<_> = ["C1", "C2", "C3", "C4"]
            .into_iter()
            .map(|book_id| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.reserve(user_id, book_id).await })
            })
            .collect();
        let results: Vec<_> = futures_util::future::join_all(handles)
            .await
            .into_iter()
            .map(|handle| handle.unwrap())
            .collect();

        assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter(|result| result.is_err())
            .all(|result| matches!(result, Err(ReservationError::LimitExceeded(3)))));
        assert_eq!(manager.list_for_user(user_id).await.unwrap().len(), 3);
        assert_eq!(store.list_available(20).await.unwrap().len(), 3);
    }
}
