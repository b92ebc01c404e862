use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub type BookId = String;
pub type UserId = i32;
pub type ReservationId = i32;

/// Legacy value stored in `books.status` for a book that can be borrowed
pub const STORED_STATUS_AVAILABLE: &str = "가능";
/// Legacy value stored in `books.status` for a book that is out on loan
pub const STORED_STATUS_LOANED: &str = "대출중";

/// Serialized with the stored strings, the browser client compares against them
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum BookStatus {
    #[serde(rename = "가능")]
    Available,
    #[serde(rename = "대출중")]
    Loaned,
}

impl BookStatus {
    pub fn as_stored_str(&self) -> &'static str {
        match self {
            BookStatus::Available => STORED_STATUS_AVAILABLE,
            BookStatus::Loaned => STORED_STATUS_LOANED,
        }
    }

    /// Older rows were written with free-form values such as "대출가능" or "열람가능",
    /// everything that does not say "available" is treated as not lendable.
    pub fn from_stored_str(value: &str) -> Self {
        if value.contains(STORED_STATUS_AVAILABLE) || value.eq_ignore_ascii_case("available") {
            BookStatus::Available
        } else {
            BookStatus::Loaned
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Normalized catalog record as produced by ingestion. Carries no status,
/// status is owned by the lending side.
pub struct CatalogRecordDetails {
    pub id: BookId,
    pub title: String,
    pub img_url: Option<String>,
    pub author: String,
    pub publisher: String,
    #[serde(rename = "callNum")]
    pub call_number: String,
    pub location: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "camelCase")]
/// Catalog record as stored, including its lending status
pub struct CatalogRecord {
    pub id: BookId,
    pub title: String,
    pub img_url: Option<String>,
    pub author: String,
    pub publisher: String,
    #[serde(rename = "callNum")]
    pub call_number: String,
    pub location: String,
    pub status: BookStatus,
}

impl CatalogRecord {
    pub fn from_details(details: CatalogRecordDetails, status: BookStatus) -> Self {
        Self {
            id: details.id,
            title: details.title,
            img_url: details.img_url,
            author: details.author,
            publisher: details.publisher,
            call_number: details.call_number,
            location: details.location,
            status,
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewUser {
    pub username: String,
    pub secret: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub id: UserId,
    pub username: String,
    #[serde(rename = "nickname")]
    pub display_name: String,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct NewReservation {
    pub user_id: UserId,
    pub book_id: BookId,
    pub start_date: NaiveDate,
    pub due_date: NaiveDate,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Reservation {
    pub id: ReservationId,
    pub user_id: UserId,
    pub book_id: BookId,
    #[serde(rename = "date")]
    pub start_date: NaiveDate,
    pub due_date: NaiveDate,
    pub extension_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
/// Reservation of a user joined with the reserved catalog record
pub struct ReservationWithRecord {
    pub reservation_id: ReservationId,
    #[serde(rename = "date")]
    pub start_date: NaiveDate,
    pub due_date: NaiveDate,
    pub extension_count: i32,
    #[serde(flatten)]
    pub record: CatalogRecord,
}
