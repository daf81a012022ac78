pub mod connection;
pub mod identity;
pub mod models;
pub mod observer;
pub mod protocol;
pub mod radio;
pub mod settings;
pub mod transmitter;
