pub mod pop3;
pub mod smtp;
