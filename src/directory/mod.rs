pub mod client;
pub mod service;

pub use client::{Channel, DirectoryApi, HttpDirectory};
pub use service::{Device, DirectoryService, LoginCheck};
