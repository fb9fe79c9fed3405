pub mod collection;
pub mod config;
pub mod crypto;
pub mod injector;
pub mod policy;
pub mod rewrap;
pub mod secure_keys;
