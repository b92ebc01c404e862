use paperclip::actix::web;

use crate::handlers;

pub fn config_app(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/health").route(web::get().to(handlers::health)))
        .service(web::resource("/search").route(web::get().to(handlers::search_records)))
        .service(web::resource("/book/{book_id}").route(web::get().to(handlers::get_record)))
        .service(
            web::scope("/api")
                .service(web::resource("/render").route(web::get().to(handlers::render_records)))
                .service(web::resource("/signup").route(web::post().to(handlers::signup)))
                .service(web::resource("/login").route(web::post().to(handlers::login)))
                .service(web::resource("/reserve").route(web::post().to(handlers::reserve)))
                .service(web::resource("/extend").route(web::post().to(handlers::extend)))
                .service(web::resource("/cancel").route(web::post().to(handlers::cancel)))
                .service(
                    web::resource("/user/{user_id}/reservations")
                        .route(web::get().to(handlers::user_reservations)),
                ),
        );
}
