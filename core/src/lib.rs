pub mod cache;
pub mod connectivity;
pub mod db;
pub mod events;
pub mod models;
pub mod remote;
pub mod service;
pub mod sync;

#[cfg(test)]
mod testing;
