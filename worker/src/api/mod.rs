use actix_web::{web, Scope};

pub mod scan;

pub fn create_api_router() -> Scope {
    web::scope("").configure(scan::configure_scan_routes)
}
