use paperclip::actix::Apiv2Schema;
use serde::{Deserialize, Serialize};

use libraryservice_repository::api::{
    BookId, CatalogRecord, ReservationId, ReservationWithRecord, User, UserId,
};

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct SearchQuery {
    pub q: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct SignupRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub nickname: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Missing ids are answered with a failure status instead of a rejected body
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub user_id: Option<UserId>,
    pub book_id: Option<BookId>,
}

/// Body of both extend and cancel calls
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Apiv2Schema)]
#[serde(rename_all = "camelCase")]
pub struct ReservationRequest {
    pub reservation_id: Option<ReservationId>,
    pub user_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RecordsResponse {
    pub count: usize,
    pub books: Vec<CatalogRecord>,
}

impl From<Vec<CatalogRecord>> for RecordsResponse {
    fn from(books: Vec<CatalogRecord>) -> Self {
        Self {
            count: books.len(),
            books,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct MessageResponse {
    pub message: String,
}

/// Outcome of a call that either succeeds or fails with a readable reason
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct StatusResponse {
    pub success: bool,
    pub message: String,
}

impl StatusResponse {
    pub fn succeeded(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoggedInUser {
    pub id: UserId,
    pub nickname: String,
}

impl From<User> for LoggedInUser {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            nickname: user.display_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LoginResponse {
    pub success: bool,
    pub user: LoggedInUser,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct UserReservationsResponse {
    pub success: bool,
    pub reservations: Vec<ReservationWithRecord>,
}
