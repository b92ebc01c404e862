use std::sync::Arc;

use actix_web::web::Data;
use actix_web::Error;
use actix_web::HttpResponse;
use paperclip::actix::{
    api_v2_operation,
    web::{self},
};

use libraryservice_repository::api::{BookId, NewUser, ReservationId, UserId};
use libraryservice_repository::records_repository::{
    RecordStore, RecordStoreError, DEFAULT_LISTING_LIMIT,
};

use crate::api::{
    LoggedInUser, LoginRequest, LoginResponse, MessageResponse, RecordsResponse,
    ReservationRequest, ReserveRequest, SearchQuery, SignupRequest, StatusResponse,
    UserReservationsResponse,
};
use crate::reservation_manager::{ReservationError, ReservationManager};

const GENERIC_FAILURE: &str = "Request could not be processed, please try again.";
const MISSING_USER_ID: &str = "User id is required.";
const MISSING_BOOK_ID: &str = "Book id is required.";
const MISSING_RESERVATION_ID: &str = "Reservation id is required.";

/// Domain failures are reported with their message, storage failures only in logs
fn failure_response(operation: &str, err: ReservationError) -> HttpResponse {
    let message = match err {
        ReservationError::Storage(err) => {
            tracing::error!("{} failed: {}", operation, err);
            GENERIC_FAILURE.to_string()
        }
        err => err.to_string(),
    };
    HttpResponse::Ok().json(StatusResponse::failed(message))
}

#[api_v2_operation]
pub async fn health() -> Result<HttpResponse, Error> {
    Ok(HttpResponse::Ok().finish())
}

#[api_v2_operation]
pub async fn render_records(
    store: Data<Arc<dyn RecordStore>>,
) -> Result<HttpResponse, Error> {
    Ok(match store.list_records(DEFAULT_LISTING_LIMIT).await {
        Ok(books) => HttpResponse::Ok().json(RecordsResponse::from(books)),
        Err(err) => {
            tracing::error!("Render records failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn search_records(
    store: Data<Arc<dyn RecordStore>>,
    query: web::Query<SearchQuery>,
) -> Result<HttpResponse, Error> {
    let Some(keyword) = query.into_inner().q.filter(|q| !q.trim().is_empty()) else {
        return Ok(HttpResponse::Ok().json(MessageResponse {
            message: "Please enter a search term.".to_string(),
        }));
    };
    tracing::info!("Search request for {}", keyword);
    Ok(
        match store.search_by_text(&keyword, DEFAULT_LISTING_LIMIT).await {
            Ok(books) => HttpResponse::Ok().json(RecordsResponse::from(books)),
            Err(err) => {
                tracing::error!("Search failed {}", err);
                HttpResponse::InternalServerError().finish()
            }
        },
    )
}

#[api_v2_operation]
pub async fn get_record(
    store: Data<Arc<dyn RecordStore>>,
    book_id: web::Path<BookId>,
) -> Result<HttpResponse, Error> {
    Ok(match store.find_by_id(&book_id.into_inner()).await {
        Ok(book) => HttpResponse::Ok().json(book),
        Err(RecordStoreError::BookNotFound(_)) => HttpResponse::NotFound().json(MessageResponse {
            message: "Book not found.".to_string(),
        }),
        Err(err) => {
            tracing::error!("Get book failed {}", err);
            HttpResponse::InternalServerError().finish()
        }
    })
}

#[api_v2_operation]
pub async fn signup(
    store: Data<Arc<dyn RecordStore>>,
    request: web::Json<SignupRequest>,
) -> Result<HttpResponse, Error> {
    let request = request.into_inner();
    if request.username.is_empty() || request.password.is_empty() || request.nickname.is_empty()
    {
        return Ok(HttpResponse::Ok().json(StatusResponse::failed("All fields are required.")));
    }
    let new_user = NewUser {
        username: request.username,
        secret: request.password,
        display_name: request.nickname,
    };
    Ok(match store.create_user(new_user).await {
        Ok(_) => HttpResponse::Ok().json(StatusResponse::succeeded("Signed up successfully.")),
        Err(err @ RecordStoreError::UsernameTaken(_)) => {
            HttpResponse::Ok().json(StatusResponse::failed(err.to_string()))
        }
        Err(err) => failure_response("Signup", err.into()),
    })
}

#[api_v2_operation]
pub async fn login(
    store: Data<Arc<dyn RecordStore>>,
    request: web::Json<LoginRequest>,
) -> Result<HttpResponse, Error> {
    Ok(
        match store
            .find_user(&request.username, &request.password)
            .await
        {
            Ok(Some(user)) => HttpResponse::Ok().json(LoginResponse {
                success: true,
                user: LoggedInUser::from(user),
            }),
            Ok(None) => HttpResponse::Ok().json(StatusResponse::failed(
                "Invalid username or password.",
            )),
            Err(err) => failure_response("Login", err.into()),
        },
    )
}

#[api_v2_operation]
pub async fn reserve(
    manager: Data<ReservationManager>,
    request: web::Json<ReserveRequest>,
) -> Result<HttpResponse, Error> {
    let request = request.into_inner();
    let Some(user_id) = request.user_id else {
        return Ok(HttpResponse::Ok().json(StatusResponse::failed(MISSING_USER_ID)));
    };
    let Some(book_id) = request.book_id.filter(|book_id| !book_id.is_empty()) else {
        return Ok(HttpResponse::Ok().json(StatusResponse::failed(MISSING_BOOK_ID)));
    };
    Ok(match manager.reserve(user_id, &book_id).await {
        Ok(_) => HttpResponse::Ok().json(StatusResponse::succeeded("Book reserved.")),
        Err(err) => failure_response("Reserve", err),
    })
}

/// Ids of an extend or cancel call, or the failure answered when one is missing
fn reservation_ids(request: &ReservationRequest) -> Result<(ReservationId, UserId), HttpResponse> {
    let reservation_id = request
        .reservation_id
        .ok_or_else(|| HttpResponse::Ok().json(StatusResponse::failed(MISSING_RESERVATION_ID)))?;
    let user_id = request
        .user_id
        .ok_or_else(|| HttpResponse::Ok().json(StatusResponse::failed(MISSING_USER_ID)))?;
    Ok((reservation_id, user_id))
}

#[api_v2_operation]
pub async fn extend(
    manager: Data<ReservationManager>,
    request: web::Json<ReservationRequest>,
) -> Result<HttpResponse, Error> {
    let (reservation_id, user_id) = match reservation_ids(&request) {
        Ok(ids) => ids,
        Err(response) => return Ok(response),
    };
    Ok(
        match manager.extend(reservation_id, user_id).await {
            Ok(_) => HttpResponse::Ok().json(StatusResponse::succeeded(format!(
                "Due date extended by {} days.",
                manager.policy().extension_days
            ))),
            Err(err) => failure_response("Extend", err),
        },
    )
}

#[api_v2_operation]
pub async fn cancel(
    manager: Data<ReservationManager>,
    request: web::Json<ReservationRequest>,
) -> Result<HttpResponse, Error> {
    let (reservation_id, user_id) = match reservation_ids(&request) {
        Ok(ids) => ids,
        Err(response) => return Ok(response),
    };
    Ok(
        match manager.cancel(reservation_id, user_id).await {
            Ok(_) => HttpResponse::Ok().json(StatusResponse::succeeded("Reservation cancelled.")),
            Err(err) => failure_response("Cancel", err),
        },
    )
}

#[api_v2_operation]
pub async fn user_reservations(
    manager: Data<ReservationManager>,
    user_id: web::Path<UserId>,
) -> Result<HttpResponse, Error> {
    Ok(match manager.list_for_user(user_id.into_inner()).await {
        Ok(reservations) => HttpResponse::Ok().json(UserReservationsResponse {
            success: true,
            reservations,
        }),
        Err(err) => {
            tracing::error!("Listing reservations failed {}", err);
            HttpResponse::Ok().json(StatusResponse::failed("Failed to load reservations."))
        }
    })
}

#[cfg(test)]
mod handler_tests {
    use actix_web::{test, App};
    use paperclip::actix::OpenApiExt;
    use serde_json::{json, Value};

    use libraryservice_repository::api::CatalogRecordDetails;
    use libraryservice_repository::records_repository::InMemoryRecordStore;

    use crate::app_config::config_app;
    use crate::reservation_manager::LendingPolicy;

    use super::*;

    fn details(id: &str, title: &str) -> CatalogRecordDetails {
        CatalogRecordDetails {
            id: id.to_string(),
            title: title.to_string(),
            img_url: None,
            author: "Han Kang".to_string(),
            publisher: "publisher".to_string(),
            call_number: "813.6".to_string(),
            location: "library".to_string(),
        }
    }

    fn app_data(
        store: Arc<dyn RecordStore>,
    ) -> (Data<Arc<dyn RecordStore>>, Data<ReservationManager>) {
        let manager = ReservationManager::new(store.clone(), LendingPolicy::default());
        (Data::new(store), Data::new(manager))
    }

    async fn store_with_books() -> Arc<dyn RecordStore> {
        let store = Arc::new(InMemoryRecordStore::default());
        store
            .upsert_records(&[
                details("1", "The Vegetarian"),
                details("2", "Human Acts"),
            ])
            .await
            .unwrap();
        store
    }

    #[actix_web::test]
    async fn test_catalog_endpoints() {
        let (store, manager) = app_data(store_with_books().await);
        let app = test::init_service(
            App::new()
                .wrap_api()
                .app_data(store)
                .app_data(manager)
                .configure(config_app)
                .build(),
        )
        .await;

        let rendered: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/api/render").to_request(),
        )
        .await;
        assert_eq!(rendered["count"], 2);

        let found: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/search?q=human").to_request(),
        )
        .await;
        assert_eq!(found["count"], 1);
        assert_eq!(found["books"][0]["id"], "2");
        assert_eq!(found["books"][0]["callNum"], "813.6");

        let missing_query: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/search").to_request(),
        )
        .await;
        assert!(missing_query["message"].is_string());

        let book: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get().uri("/book/1").to_request(),
        )
        .await;
        assert_eq!(book["title"], "The Vegetarian");
        assert_eq!(book["status"], "가능");

        let response =
            test::call_service(&app, test::TestRequest::get().uri("/book/404").to_request()).await;
        assert_eq!(response.status(), actix_web::http::StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn test_signup_and_login() {
        let (store, manager) = app_data(store_with_books().await);
        let app = test::init_service(
            App::new()
                .wrap_api()
                .app_data(store)
                .app_data(manager)
                .configure(config_app)
                .build(),
        )
        .await;
        let signup = || {
            test::TestRequest::post()
                .uri("/api/signup")
                .set_json(json!({"username": "reader", "password": "pw", "nickname": "Reader"}))
                .to_request()
        };

        let created: Value = test::call_and_read_body_json(&app, signup()).await;
        assert_eq!(created["success"], true);
        let duplicate: Value = test::call_and_read_body_json(&app, signup()).await;
        assert_eq!(duplicate["success"], false);

        let incomplete: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/signup")
                .set_json(json!({"username": "other"}))
                .to_request(),
        )
        .await;
        assert_eq!(incomplete["success"], false);

        let logged_in: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/login")
                .set_json(json!({"username": "reader", "password": "pw"}))
                .to_request(),
        )
        .await;
        assert_eq!(logged_in["success"], true);
        assert_eq!(logged_in["user"]["nickname"], "Reader");
        assert!(logged_in["user"]["id"].is_number());

        let wrong_password: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::post()
                .uri("/api/login")
                .set_json(json!({"username": "reader", "password": "nope"}))
                .to_request(),
        )
        .await;
        assert_eq!(wrong_password["success"], false);
    }

    #[actix_web::test]
    /// Reserve, list, extend twice and cancel through the http surface
    async fn test_reservation_endpoints() {
        let store = store_with_books().await;
        let user_id = store
            .create_user(NewUser {
                username: "reader".to_string(),
                secret: "pw".to_string(),
                display_name: "Reader".to_string(),
            })
            .await
            .unwrap();
        let (store_data, manager) = app_data(store.clone());
        let app = test::init_service(
            App::new()
                .wrap_api()
                .app_data(store_data)
                .app_data(manager)
                .configure(config_app)
                .build(),
        )
        .await;
        let post = |uri: &str, body: Value| {
            test::TestRequest::post()
                .uri(uri)
                .set_json(body)
                .to_request()
        };

        let reserved: Value = test::call_and_read_body_json(
            &app,
            post("/api/reserve", json!({"userId": user_id, "bookId": "1"})),
        )
        .await;
        assert_eq!(reserved["success"], true);

        let taken: Value = test::call_and_read_body_json(
            &app,
            post("/api/reserve", json!({"userId": user_id, "bookId": "1"})),
        )
        .await;
        assert_eq!(taken["success"], false);
        assert!(taken["message"].as_str().unwrap().contains("1"));

        let listed: Value = test::call_and_read_body_json(
            &app,
            test::TestRequest::get()
                .uri(&format!("/api/user/{}/reservations", user_id))
                .to_request(),
        )
        .await;
        assert_eq!(listed["success"], true);
        let reservation = &listed["reservations"][0];
        assert_eq!(reservation["id"], "1");
        assert_eq!(reservation["extension_count"], 0);
        assert_eq!(reservation["status"], "대출중");
        let reservation_id = reservation["reservation_id"].as_i64().unwrap();

        let extended: Value = test::call_and_read_body_json(
            &app,
            post(
                "/api/extend",
                json!({"reservationId": reservation_id, "userId": user_id}),
            ),
        )
        .await;
        assert_eq!(extended["success"], true);
        let extended_again: Value = test::call_and_read_body_json(
            &app,
            post(
                "/api/extend",
                json!({"reservationId": reservation_id, "userId": user_id}),
            ),
        )
        .await;
        assert_eq!(extended_again["success"], false);

        let cancelled: Value = test::call_and_read_body_json(
            &app,
            post(
                "/api/cancel",
                json!({"reservationId": reservation_id, "userId": user_id}),
            ),
        )
        .await;
        assert_eq!(cancelled["success"], true);
        assert_eq!(
            store.find_by_id("1").await.unwrap().status,
            libraryservice_repository::api::BookStatus::Available
        );
    }

    #[actix_web::test]
    async fn test_lending_calls_without_ids_fail_with_message() {
        let (store, manager) = app_data(store_with_books().await);
        let app = test::init_service(
            App::new()
                .wrap_api()
                .app_data(store)
                .app_data(manager)
                .configure(config_app)
                .build(),
        )
        .await;
        let cases = [
            ("/api/reserve", json!({}), MISSING_USER_ID),
            ("/api/reserve", json!({"userId": 1}), MISSING_BOOK_ID),
            ("/api/reserve", json!({"userId": 1, "bookId": ""}), MISSING_BOOK_ID),
            ("/api/extend", json!({"userId": 1}), MISSING_RESERVATION_ID),
            ("/api/extend", json!({"reservationId": 1}), MISSING_USER_ID),
            ("/api/cancel", json!({}), MISSING_RESERVATION_ID),
            ("/api/cancel", json!({"reservationId": 1}), MISSING_USER_ID),
        ];

        for (uri, body, message) in cases {
            let response = test::call_service(
                &app,
                test::TestRequest::post().uri(uri).set_json(body).to_request(),
            )
            .await;
            assert_eq!(response.status(), actix_web::http::StatusCode::OK, "{}", uri);
            let answered: Value = test::read_body_json(response).await;
            assert_eq!(answered["success"], false, "{}", uri);
            assert_eq!(answered["message"], message, "{}", uri);
        }
    }
}
