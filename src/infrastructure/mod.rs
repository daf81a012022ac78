pub mod bluetooth;
pub mod identity_store;
pub mod logging;
