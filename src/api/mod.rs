pub mod models;
pub mod response;
pub mod routes;
pub mod static_files;
