use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::api::{
    BookStatus, CatalogRecord, CatalogRecordDetails, NewReservation, NewUser, Reservation,
    ReservationId, ReservationWithRecord, User, UserId,
};
use crate::credentials;
use crate::records_repository::{
    dedup_by_id, RecordStore, RecordStoreError, RecordTransaction,
};

struct StoredUser {
    username: String,
    secret_digest: String,
    display_name: String,
}

#[derive(Default)]
struct CatalogState {
    books: BTreeMap<String, CatalogRecord>,
    reservations: BTreeMap<ReservationId, Reservation>,
}

/// Store kept entirely in process memory.
/// Transactions take the catalog lock for their whole lifetime.
pub struct InMemoryRecordStore {
    catalog: Arc<Mutex<CatalogState>>,
    users: Arc<parking_lot::RwLock<HashMap<UserId, StoredUser>>>,
    user_sequence_generator: AtomicI32,
    reservation_sequence_generator: Arc<AtomicI32>,
}

impl Default for InMemoryRecordStore {
    fn default() -> Self {
        Self {
            catalog: Default::default(),
            users: Default::default(),
            user_sequence_generator: AtomicI32::new(1),
            reservation_sequence_generator: Arc::new(AtomicI32::new(1)),
        }
    }
}

#[async_trait::async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert_records(
        &self,
        records: &[CatalogRecordDetails],
    ) -> Result<usize, RecordStoreError> {
        let records = dedup_by_id(records);
        let mut catalog = self.catalog.lock().await;
        for details in records.iter() {
            let status = catalog
                .books
                .get(&details.id)
                .map(|existing| existing.status)
                .unwrap_or(BookStatus::Available);
            catalog.books.insert(
                details.id.clone(),
                CatalogRecord::from_details(details.clone(), status),
            );
        }
        Ok(records.len())
    }

    async fn find_by_id(&self, book_id: &str) -> Result<CatalogRecord, RecordStoreError> {
        self.catalog
            .lock()
            .await
            .books
            .get(book_id)
            .cloned()
            .ok_or_else(|| RecordStoreError::BookNotFound(book_id.to_string()))
    }

    async fn search_by_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        let needle = query.to_lowercase();
        Ok(self
            .catalog
            .lock()
            .await
            .books
            .values()
            .filter(|record| {
                record.title.to_lowercase().contains(&needle)
                    || record.author.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_records(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        Ok(self
            .catalog
            .lock()
            .await
            .books
            .values()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn list_available(&self, limit: usize) -> Result<Vec<CatalogRecord>, RecordStoreError> {
        Ok(self
            .catalog
            .lock()
            .await
            .books
            .values()
            .filter(|record| record.status == BookStatus::Available)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn create_user(&self, new_user: NewUser) -> Result<UserId, RecordStoreError> {
        let mut users = self.users.write();
        if users
            .values()
            .any(|user| user.username == new_user.username)
        {
            return Err(RecordStoreError::UsernameTaken(new_user.username));
        }
        let id = self.user_sequence_generator.fetch_add(1, Ordering::Relaxed);
        users.insert(
            id,
            StoredUser {
                username: new_user.username,
                secret_digest: credentials::hash_secret(&new_user.secret),
                display_name: new_user.display_name,
            },
        );
        Ok(id)
    }

    async fn find_user(
        &self,
        username: &str,
        secret: &str,
    ) -> Result<Option<User>, RecordStoreError> {
        Ok(self
            .users
            .read()
            .iter()
            .find(|(_, user)| user.username == username)
            .filter(|(_, user)| credentials::verify_secret(secret, &user.secret_digest))
            .map(|(&id, user)| User {
                id,
                username: user.username.clone(),
                display_name: user.display_name.clone(),
            }))
    }

    async fn list_reservations_for_user(
        &self,
        user_id: UserId,
    ) -> Result<Vec<ReservationWithRecord>, RecordStoreError> {
        let catalog = self.catalog.lock().await;
        Ok(catalog
            .reservations
            .values()
            .filter(|reservation| reservation.user_id == user_id)
            .filter_map(|reservation| {
                catalog
                    .books
                    .get(&reservation.book_id)
                    .map(|record| ReservationWithRecord {
                        reservation_id: reservation.id,
                        start_date: reservation.start_date,
                        due_date: reservation.due_date,
                        extension_count: reservation.extension_count,
                        record: record.clone(),
                    })
            })
            .collect())
    }

    async fn begin_serializable(&self) -> Result<Box<dyn RecordTransaction>, RecordStoreError> {
        let guard = self.catalog.clone().lock_owned().await;
        let reservations = guard.reservations.clone();
        Ok(Box::new(InMemoryTransaction {
            guard,
            reservations,
            status_changes: Default::default(),
            users: self.users.clone(),
            reservation_sequence_generator: self.reservation_sequence_generator.clone(),
        }))
    }
}

/// Writes are staged on copies and land in the shared state only on commit
struct InMemoryTransaction {
    guard: OwnedMutexGuard<CatalogState>,
    reservations: BTreeMap<ReservationId, Reservation>,
    status_changes: HashMap<String, BookStatus>,
    users: Arc<parking_lot::RwLock<HashMap<UserId, StoredUser>>>,
    reservation_sequence_generator: Arc<AtomicI32>,
}

#[async_trait::async_trait]
impl RecordTransaction for InMemoryTransaction {
    async fn book_status(&mut self, book_id: &str) -> Result<Option<BookStatus>, RecordStoreError> {
        Ok(self.guard.books.get(book_id).map(|record| {
            self.status_changes
                .get(book_id)
                .copied()
                .unwrap_or(record.status)
        }))
    }

    async fn set_book_status(
        &mut self,
        book_id: &str,
        status: BookStatus,
    ) -> Result<(), RecordStoreError> {
        if !self.guard.books.contains_key(book_id) {
            return Err(RecordStoreError::BookNotFound(book_id.to_string()));
        }
        self.status_changes.insert(book_id.to_string(), status);
        Ok(())
    }

    async fn user_exists(&mut self, user_id: UserId) -> Result<bool, RecordStoreError> {
        Ok(self.users.read().contains_key(&user_id))
    }

    async fn count_reservations(&mut self, user_id: UserId) -> Result<usize, RecordStoreError> {
        Ok(self
            .reservations
            .values()
            .filter(|reservation| reservation.user_id == user_id)
            .count())
    }

    async fn insert_reservation(
        &mut self,
        reservation: NewReservation,
    ) -> Result<Reservation, RecordStoreError> {
        if !self.users.read().contains_key(&reservation.user_id) {
            return Err(RecordStoreError::ConstraintViolation(format!(
                "user {} does not exist",
                reservation.user_id
            )));
        }
        if !self.guard.books.contains_key(&reservation.book_id) {
            return Err(RecordStoreError::ConstraintViolation(format!(
                "book {} does not exist",
                reservation.book_id
            )));
        }
        let id = self
            .reservation_sequence_generator
            .fetch_add(1, Ordering::Relaxed);
        let inserted = Reservation {
            id,
            user_id: reservation.user_id,
            book_id: reservation.book_id,
            start_date: reservation.start_date,
            due_date: reservation.due_date,
            extension_count: 0,
        };
        self.reservations.insert(id, inserted.clone());
        Ok(inserted)
    }

    async fn find_reservation(
        &mut self,
        reservation_id: ReservationId,
        user_id: UserId,
    ) -> Result<Option<Reservation>, RecordStoreError> {
        Ok(self
            .reservations
            .get(&reservation_id)
            .filter(|reservation| reservation.user_id == user_id)
            .cloned())
    }

    async fn update_reservation(
        &mut self,
        reservation: &Reservation,
    ) -> Result<(), RecordStoreError> {
        match self.reservations.get_mut(&reservation.id) {
            Some(stored) => {
                stored.due_date = reservation.due_date;
                stored.extension_count = reservation.extension_count;
                Ok(())
            }
            None => Err(RecordStoreError::Other(format!(
                "Reservation {} vanished during transaction",
                reservation.id
            ))),
        }
    }

    async fn delete_reservation(
        &mut self,
        reservation_id: ReservationId,
    ) -> Result<(), RecordStoreError> {
        self.reservations.remove(&reservation_id);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), RecordStoreError> {
        let InMemoryTransaction {
            mut guard,
            reservations,
            status_changes,
            ..
        } = *self;
        guard.reservations = reservations;
        for (book_id, status) in status_changes {
            if let Some(record) = guard.books.get_mut(&book_id) {
                record.status = status;
            }
        }
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), RecordStoreError> {
        Ok(())
    }
}
