pub mod audit;
pub mod credentials;
pub mod deletion;
pub mod device;
pub mod notification;
pub mod registration;
pub mod user;
